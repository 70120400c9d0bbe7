//! Built-in transformers.

pub mod extensions;

use std::sync::Arc;

use crate::transformer::SharedTransformer;

pub use extensions::ExtensionsTransformer;

/// Every transformer shipped with the engine, in upgrade order.
pub fn builtin() -> Vec<SharedTransformer> {
    vec![Arc::new(ExtensionsTransformer::new())]
}
