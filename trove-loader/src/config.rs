use crate::diagnostics::DiagnosticEvent;
use crate::error::TroveError;
use crate::handle::GenericHandle;
use crate::provider::ResourceProvider;
use std::sync::Arc;

/// Receives every operation failure. Replaces a process-wide exception handler.
pub type ErrorSink = Arc<dyn Fn(&GenericHandle, &TroveError) + Send + Sync>;
pub type DiagnosticsCallback = Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>;

/// Everything a `ResourceManager` is constructed with. There is no global state, two managers built
/// from different configs never observe each other.
#[derive(Clone)]
pub struct ResourceManagerConfig {
    // Searched in order, the first provider whose id matches and that can provide the requested
    // type is used
    pub providers: Vec<Arc<dyn ResourceProvider>>,
    pub error_sink: Option<ErrorSink>,
    pub diagnostics: Option<DiagnosticsCallback>,
    // Log failed operations at error level
    pub log_failures: bool,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        ResourceManagerConfig {
            providers: Vec::default(),
            error_sink: None,
            diagnostics: None,
            log_failures: true,
        }
    }
}

impl ResourceManagerConfig {
    pub fn with_provider(
        mut self,
        provider: Arc<dyn ResourceProvider>,
    ) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_error_sink(
        mut self,
        error_sink: ErrorSink,
    ) -> Self {
        self.error_sink = Some(error_sink);
        self
    }

    pub fn with_diagnostics(
        mut self,
        diagnostics: DiagnosticsCallback,
    ) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_log_failures(
        mut self,
        log_failures: bool,
    ) -> Self {
        self.log_failures = log_failures;
        self
    }
}
