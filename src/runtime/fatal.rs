use crate::runtime::pipeline::PipelineError;
use anyhow::Error as AnyError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// First-error capture for fatal pipeline failures.
///
/// The first trigger wins: it records the cause, cancels the run and root
/// tokens so every task starts draining, and later triggers are ignored.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    captured: Mutex<Option<AbortCause>>,
}

/// Cloneable handle to the error that aborted a run.
#[derive(Clone)]
pub struct AbortCause {
    inner: Arc<AnyError>,
}

impl AbortCause {
    pub(crate) fn new(inner: AnyError) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AbortCause").field(&self.inner).finish()
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner.as_ref(), f)
    }
}

impl std::error::Error for AbortCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                root_shutdown,
                run_shutdown,
                captured: Mutex::new(None),
            }),
        }
    }

    /// Records a fatal stage error and initiates shutdown.
    pub fn trigger(&self, error: PipelineError) -> AnyError {
        let stage = error.stage();

        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return error.into();
        }

        tracing::error!(
            stage = ?stage,
            error = %error,
            "fatal pipeline error; initiating drain"
        );

        self.capture(AbortCause::new(error.into()))
    }

    /// Records a fatal error originating outside the pipeline stages, such
    /// as a worker panic.
    pub fn trigger_external(&self, context: &str, error: AnyError) -> AnyError {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return error;
        }

        tracing::error!(
            context,
            error = %error,
            "fatal pipeline error; initiating drain"
        );

        self.capture(AbortCause::new(error))
    }

    fn capture(&self, cause: AbortCause) -> AnyError {
        {
            let mut slot = self.inner.captured.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause.clone());
            }
        }

        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();

        cause.into()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<AbortCause> {
        self.inner.captured.lock().unwrap().clone()
    }
}
