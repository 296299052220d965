//! CPU profiling hooks.
//!
//! Render code marks scopes with [`profile_function!`] and [`profile_scope!`];
//! they cost next to nothing until recording is switched on by
//! [`Profiler::start`]. The render manager closes each puffin frame through
//! [`new_frame`].

pub use puffin::{profile_function, profile_scope};

use crate::config::ConfigStore;

/// What the profiler records and where it is served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilingOptions {
    /// Records scopes.
    pub record: bool,
    /// Address a `puffin_viewer` can connect to, e.g. `127.0.0.1:8585`.
    pub http_address: Option<String>,
}

impl ProfilingOptions {
    /// Reads `Profiling.Enabled` and `Profiling.HttpAddress`.
    ///
    /// An address turns recording on even without `Profiling.Enabled`.
    pub fn from_config(config: &ConfigStore) -> Self {
        let http_address = config
            .get_str("Profiling.HttpAddress")
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(str::to_owned);
        Self {
            record: config.get_bool("Profiling.Enabled", false) || http_address.is_some(),
            http_address,
        }
    }
}

/// Keeps the profiling server alive; recording stops when dropped.
#[derive(Default)]
pub struct Profiler {
    #[cfg(feature = "profiling")]
    server: Option<puffin_http::Server>,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler").field("serving", &self.is_serving()).finish()
    }
}

impl Profiler {
    pub fn start(options: &ProfilingOptions) -> Self {
        puffin::set_scopes_on(options.record);
        let mut profiler = Self::default();
        if let Some(address) = &options.http_address {
            profiler.serve(address);
        }
        profiler
    }

    #[cfg(feature = "profiling")]
    fn serve(&mut self, address: &str) {
        match puffin_http::Server::new(address) {
            Ok(server) => {
                tracing::info!("Puffin server listening on {}", address);
                self.server = Some(server);
            }
            Err(err) => tracing::error!("Failed to start puffin server on {}: {}", address, err),
        }
    }

    #[cfg(not(feature = "profiling"))]
    fn serve(&mut self, address: &str) {
        tracing::warn!("Built without the profiling feature, not serving on {}", address);
    }

    pub fn is_serving(&self) -> bool {
        #[cfg(feature = "profiling")]
        {
            self.server.is_some()
        }
        #[cfg(not(feature = "profiling"))]
        {
            false
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        puffin::set_scopes_on(false);
    }
}

/// Closes the current puffin frame.
#[inline]
pub fn new_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}
