//! Per-pass evaluation context.
//!
//! An [`OutputContext`] names *what* is being rendered (frame, view,
//! proxy scale) and hashes deterministically so caches can key on it. A
//! [`Context`] adds the shared [`World`], the abort flag and the error
//! channel engines report through.
//!
//! # Usage
//!
//! ```rust
//! use vfx_graph::{Context, OutputContext, Severity};
//!
//! let ctx = Context::new(vfx_core::World::new()).with_output(OutputContext::frame(12.0));
//! assert_eq!(ctx.output().frame, 12.0);
//!
//! ctx.report(Severity::Soft, "Read1", "frame 12 missing");
//! assert!(!ctx.has_hard_error());
//!
//! ctx.abort();
//! assert!(ctx.aborted());
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;
use vfx_core::World;

/// Frame, view and proxy scale of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputContext {
    /// Frame number; fractional for motion blur sub-frames.
    pub frame: f64,
    /// View name, `"main"` for mono.
    pub view: String,
    /// Proxy scale, 1.0 at full resolution.
    pub proxy_scale: f64,
}

impl Default for OutputContext {
    fn default() -> Self {
        Self {
            frame: 1.0,
            view: "main".to_string(),
            proxy_scale: 1.0,
        }
    }
}

impl OutputContext {
    /// Default context at a frame.
    pub fn frame(frame: f64) -> Self {
        Self {
            frame,
            ..Default::default()
        }
    }

    /// Sets the view.
    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = view.into();
        self
    }

    /// Sets the proxy scale.
    pub fn with_proxy_scale(mut self, scale: f64) -> Self {
        self.proxy_scale = scale;
        self
    }

    /// Integer frame, rounded towards negative infinity.
    pub fn int_frame(&self) -> i32 {
        self.frame.floor() as i32
    }

    /// Deterministic hash of the context.
    pub fn hash_value(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        h.finish()
    }
}

impl Hash for OutputContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frame.to_bits().hash(state);
        self.view.hash(state);
        self.proxy_scale.to_bits().hash(state);
    }
}

/// How bad a reported error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable, e.g. one missing frame of a sequence.
    Soft,
    /// The output cannot be trusted.
    Hard,
}

/// An error reported through the context.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedError {
    /// Operator that reported it.
    pub op: String,
    /// Soft or hard.
    pub severity: Severity,
    /// Message.
    pub message: String,
}

/// Evaluation context shared by every engine call of a pass.
#[derive(Debug)]
pub struct Context {
    world: Arc<World>,
    output: OutputContext,
    abort: Arc<AtomicBool>,
    errors: Mutex<Vec<ReportedError>>,
    strict: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(World::global())
    }
}

impl Context {
    /// Context over a world with the default output context.
    pub fn new(world: Arc<World>) -> Self {
        Self {
            world,
            output: OutputContext::default(),
            abort: Arc::new(AtomicBool::new(false)),
            errors: Mutex::new(Vec::new()),
            strict: false,
        }
    }

    /// Replaces the output context.
    pub fn with_output(mut self, output: OutputContext) -> Self {
        self.output = output;
        self
    }

    /// Promotes soft errors to hard ones.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Context for another frame/view sharing world, abort flag and strictness.
    ///
    /// The error list starts empty.
    pub fn derive(&self, output: OutputContext) -> Self {
        Self {
            world: self.world.clone(),
            output,
            abort: self.abort.clone(),
            errors: Mutex::new(Vec::new()),
            strict: self.strict,
        }
    }

    /// Shared registries.
    #[inline]
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Frame, view and proxy scale.
    #[inline]
    pub fn output(&self) -> &OutputContext {
        &self.output
    }

    /// Hash of the output context.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.output.hash_value()
    }

    /// True in strict mode.
    #[inline]
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Raises the abort flag. Sticky until [`reset`](Self::reset).
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// True once [`abort`](Self::abort) has been called.
    #[inline]
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// A handle that can abort this context from another thread.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Clears the abort flag and the error list.
    pub fn reset(&self) {
        self.abort.store(false, Ordering::SeqCst);
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Records an error. Hard errors (and soft ones in strict mode) also
    /// abort the pass.
    pub fn report(&self, severity: Severity, op: &str, message: impl Into<String>) {
        let severity = if self.strict { Severity::Hard } else { severity };
        let message = message.into();
        warn!(op, ?severity, "{}", message);
        if severity == Severity::Hard {
            self.abort();
        }
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ReportedError {
                op: op.to_string(),
                severity,
                message,
            });
    }

    /// Snapshot of reported errors.
    pub fn errors(&self) -> Vec<ReportedError> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True if any hard error was reported.
    pub fn has_hard_error(&self) -> bool {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.severity == Severity::Hard)
    }
}
