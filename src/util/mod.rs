pub mod path;

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future used at the async trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
