//! Concrete [`vmrkl_core::transport::Transport`] implementations and the
//! registry wiring for `file://` (always), `mock://` (test-only), and
//! `http://`/`https://` (behind the `http-transport` feature).

mod file;
mod mock;

#[cfg(feature = "http-transport")]
mod http;

pub use file::FileTransport;
pub use mock::MockTransport;

#[cfg(feature = "http-transport")]
pub use http::HttpTransport;

use std::sync::Arc;

use vmrkl_core::transport::{TransportError, TransportRegistry};

/// A registry pre-populated with every provider this crate ships,
/// suitable as a starting point for the CLI or a custom binary.
#[must_use]
pub fn default_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register(
        "file",
        Arc::new(|url: &str| -> Result<Arc<dyn vmrkl_core::transport::Transport>, TransportError> {
            let path = file::path_from_file_url(url)?;
            Ok(Arc::new(FileTransport::new(path)))
        }),
    );
    #[cfg(feature = "http-transport")]
    {
        registry.register(
            "http",
            Arc::new(|url: &str| -> Result<Arc<dyn vmrkl_core::transport::Transport>, TransportError> {
                Ok(Arc::new(HttpTransport::new(url.to_string())))
            }),
        );
        registry.register(
            "https",
            Arc::new(|url: &str| -> Result<Arc<dyn vmrkl_core::transport::Transport>, TransportError> {
                Ok(Arc::new(HttpTransport::new(url.to_string())))
            }),
        );
    }
    registry
}
