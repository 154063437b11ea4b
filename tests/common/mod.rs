#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use diffusion_runner::display::HostCapabilities;
use diffusion_runner::engine::{BackendEvent, BackendKind, ExecutionBackend, Submission};
use diffusion_runner::error::RunnerError;
use diffusion_runner::model::JobEvent;
use diffusion_runner::native::{ComputeBackend, ConversionBackend, PassthroughConverter};
use diffusion_runner::orchestrator::{ControllerParts, JobController};
use diffusion_runner::source::ImageSource;
use diffusion_runner::store::StagedFileStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reverses the input bytes and reports 25% and 50% on the way.
pub struct ReversingFilter {
    pub calls: AtomicUsize,
    pub last_args: Mutex<Vec<String>>,
    pub status: i32,
}

impl ReversingFilter {
    pub fn new() -> Arc<Self> {
        Self::with_status(0)
    }

    pub fn with_status(status: i32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            last_args: Mutex::new(Vec::new()),
            status,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ComputeBackend for ReversingFilter {
    fn call_main(
        &self,
        store: &mut StagedFileStore,
        args: &[String],
        progress: &mut dyn FnMut(u8),
    ) -> i32 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_args.lock().unwrap() = args.to_vec();
        if self.status != 0 {
            return self.status;
        }
        let input = match store.read_path(&args[0]) {
            Ok(bytes) => bytes,
            Err(_) => return 2,
        };
        progress(25);
        let mut out = input.to_vec();
        out.reverse();
        progress(50);
        match store.write_path(&args[1], out) {
            Ok(()) => 0,
            Err(_) => 3,
        }
    }
}

/// In-memory image namespace that counts fetches.
#[derive(Default)]
pub struct MemoryImages {
    pub images: HashMap<String, Bytes>,
    pub fetches: AtomicUsize,
}

impl MemoryImages {
    pub fn with(names: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(Self {
            images: names
                .iter()
                .map(|(n, b)| (n.to_string(), Bytes::copy_from_slice(b)))
                .collect(),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for MemoryImages {
    async fn fetch(&self, name: &str) -> Result<Bytes, RunnerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::Transport(format!("images/{name}: HTTP 404")))
    }
}

/// Fails the first conversion, then behaves like [`PassthroughConverter`].
#[derive(Default)]
pub struct FailFirstConverter {
    calls: AtomicUsize,
}

impl ConversionBackend for FailFirstConverter {
    fn convert_and_resample(
        &self,
        store: &mut StagedFileStore,
        raw_path: &str,
        display_path: &str,
    ) -> i32 {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return 1;
        }
        PassthroughConverter.convert_and_resample(store, raw_path, display_path)
    }
}

/// Backend whose events are pushed by the test.
pub struct ScriptedBackend {
    pub submissions: Arc<Mutex<Vec<Submission>>>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl ScriptedBackend {
    pub fn channel() -> (
        Self,
        mpsc::UnboundedSender<BackendEvent>,
        Arc<Mutex<Vec<Submission>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let submissions = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                submissions: submissions.clone(),
                events: rx,
            },
            tx,
            submissions,
        )
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Worker
    }

    fn submit(
        &mut self,
        submission: Submission,
        _store: &mut StagedFileStore,
    ) -> Result<(), RunnerError> {
        self.submissions.lock().unwrap().push(submission);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }
}

pub fn controller_with(
    backend: Box<dyn ExecutionBackend>,
    converter: Arc<dyn ConversionBackend>,
    images: Arc<dyn ImageSource>,
) -> (JobController, mpsc::UnboundedReceiver<JobEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let parts = ControllerParts {
        backend,
        converter,
        images,
        host: HostCapabilities { object_urls: true },
    };
    let controller = JobController::new(parts, Default::default(), tx).unwrap();
    (controller, rx)
}

/// Pump backend events into the controller until the current job settles.
pub async fn settle(controller: &mut JobController) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.is_busy() {
            match controller.next_backend_event().await {
                Some(event) => controller.handle_backend_event(event),
                None => controller.backend_lost(),
            }
        }
    })
    .await
    .expect("job did not settle");
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}
