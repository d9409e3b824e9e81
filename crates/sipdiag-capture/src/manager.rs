//! Capture manager: input/output lifecycle, filtering and pause.

use crate::error::CaptureResult;
use crate::filter::CaptureFilter;
use crate::input::CaptureInput;
use sipdiag_storage::{PacketSink, Storage};
use sipdiag_types::Address;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Owns the capture inputs and outputs and drives their lifecycle.
pub struct CaptureManager {
    storage: Storage,
    inputs: Vec<Box<dyn CaptureInput>>,
    filter: CaptureFilter,
    paused: Arc<AtomicBool>,
    /// TLS key file for decrypting captured TLS, when configured.
    keyfile: Option<PathBuf>,
    /// Server address whose TLS traffic the key file covers.
    tls_server: Option<Address>,
    started: bool,
}

impl CaptureManager {
    /// Creates a manager bound to a storage engine.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            inputs: Vec::new(),
            filter: CaptureFilter::all(),
            paused: Arc::new(AtomicBool::new(false)),
            keyfile: None,
            tls_server: None,
            started: false,
        }
    }

    /// The storage engine fed by this manager's inputs.
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The pause flag shared with every input.
    #[must_use]
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Registers a capture input.
    pub fn add_input(&mut self, input: Box<dyn CaptureInput>) {
        self.inputs.push(input);
    }

    /// Registers a capture output with storage.
    pub fn add_output(&self, output: Box<dyn PacketSink>) {
        self.storage.add_output(output);
    }

    /// The registered inputs.
    #[must_use]
    pub fn inputs(&self) -> &[Box<dyn CaptureInput>] {
        &self.inputs
    }

    /// Configures the TLS key file and the server it covers.
    pub fn set_keyfile(&mut self, keyfile: PathBuf, server: Address) {
        self.keyfile = Some(keyfile);
        self.tls_server = Some(server);
    }

    /// The configured TLS key file.
    #[must_use]
    pub fn keyfile(&self) -> Option<&PathBuf> {
        self.keyfile.as_ref()
    }

    /// Starts the storage consumer and every input.
    pub fn start(&mut self) -> CaptureResult<()> {
        if !self.started {
            self.storage.start().ok();
            self.started = true;
        }

        for input in &mut self.inputs {
            input.start()?;
            info!(source = input.source(), "capture input started");
        }
        Ok(())
    }

    /// Stops every input and the storage consumer.
    pub fn stop(&mut self) {
        for input in &mut self.inputs {
            input.stop();
            info!(source = input.source(), "capture input stopped");
        }
        self.storage.stop();
    }

    /// Applies a BPF filter to every input.
    ///
    /// On failure the previous filter is restored on the inputs already
    /// changed, so all inputs keep filtering consistently.
    pub fn set_filter(&mut self, filter: CaptureFilter) -> CaptureResult<()> {
        let previous = self.filter.clone();

        for at in 0..self.inputs.len() {
            if let Err(e) = self.inputs[at].set_filter(&filter) {
                error!(error = %e, "applying capture filter failed");
                for input in &mut self.inputs[..at] {
                    let _ = input.set_filter(&previous);
                }
                return Err(e);
            }
        }

        self.filter = filter;
        Ok(())
    }

    /// The active BPF filter.
    #[must_use]
    pub fn filter(&self) -> &CaptureFilter {
        &self.filter
    }

    /// Pauses or resumes packet intake.
    ///
    /// Paused inputs keep reading from their sources but drop every
    /// packet instead of enqueueing it.
    pub fn set_pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Whether intake is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether any input replays a finite source.
    #[must_use]
    pub fn has_offline_input(&self) -> bool {
        self.inputs
            .iter()
            .any(|i| i.mode() == crate::input::CaptureMode::Offline)
    }
}
