//! Attach scenario traced through the UTF-16 diagnostic log

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use k2s_winhelpers::compartment::{
    attach_process, CompartmentApi, CompartmentId, PendingRequests, RequestId, ThreadEntry,
    ThreadHost,
};
use k2s_winhelpers::config::HookConfig;
use k2s_winhelpers::logging::DiagnosticLog;
use k2s_winhelpers::{Error, Result};
use parking_lot::Mutex;

const PID: u32 = 700;
const ATTACHING: u32 = 1;

struct FakeHost {
    threads: Vec<u32>,
    unopenable: Vec<u32>,
    queued: Mutex<Vec<(u32, RequestId)>>,
}

impl FakeHost {
    fn new(threads: &[u32]) -> Self {
        Self {
            threads: threads.to_vec(),
            unopenable: Vec::new(),
            queued: Mutex::new(Vec::new()),
        }
    }
}

impl ThreadHost for FakeHost {
    type Thread = u32;

    fn current_process_id(&self) -> u32 {
        PID
    }

    fn current_thread_id(&self) -> u32 {
        ATTACHING
    }

    fn snapshot_threads(&self) -> Result<Vec<ThreadEntry>> {
        let mut entries: Vec<_> = self
            .threads
            .iter()
            .map(|&thread_id| ThreadEntry { thread_id, owner_process_id: PID })
            .collect();
        entries.push(ThreadEntry { thread_id: 99, owner_process_id: PID + 1 });
        Ok(entries)
    }

    fn open_thread(&self, thread_id: u32) -> Result<u32> {
        if self.unopenable.contains(&thread_id) {
            return Err(Error::OpenThread { thread_id, code: 5 });
        }
        Ok(thread_id)
    }

    fn queue_apc(&self, thread: &u32, request: RequestId) -> Result<()> {
        self.queued.lock().push((*thread, request));
        Ok(())
    }
}

#[derive(Default)]
struct Stack {
    sets: AtomicUsize,
}

impl CompartmentApi for Stack {
    fn set_current_thread_compartment(&self, _id: CompartmentId) -> u32 {
        self.sets.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn current_thread_compartment(&self) -> Option<CompartmentId> {
        Some(CompartmentId(3))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes.len() % 2, 0);
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units).unwrap();
    assert!(text.ends_with("\r\n"));
    text.split_terminator("\r\n").map(str::to_string).collect()
}

/// `[HH:MM:SS.mmm] ` prefix
fn strip_timestamp(line: &str) -> &str {
    let b = line.as_bytes();
    assert!(b.len() > 15, "{line}");
    assert_eq!(b[0], b'[');
    assert_eq!(b[3], b':');
    assert_eq!(b[6], b':');
    assert_eq!(b[9], b'.');
    assert_eq!(&line[13..15], "] ");
    &line[15..]
}

#[test]
fn test_attach_three_threads_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cphook.log");
    let config = HookConfig::builder().log_file(&path).attach_compartment(3).build();
    let log = DiagnosticLog::open(&config).unwrap();

    let host = FakeHost::new(&[ATTACHING, 2, 3]);
    let pending = PendingRequests::new();
    let stack = Arc::new(Stack::default());

    tracing::subscriber::with_default(log.subscriber(), || {
        let api: Arc<dyn CompartmentApi> = stack.clone();
        let summary = attach_process(&host, &pending, config.attach_compartment, || Ok(api)).unwrap();
        assert_eq!(summary.direct, Some(0));
        assert_eq!(summary.queued, 2);

        for (thread, request) in host.queued.lock().iter() {
            assert_eq!(pending.execute(*request, *thread), Some(0));
        }
    });
    log.close();

    let lines = read_lines(&path);
    let messages: Vec<&str> = lines.iter().map(|l| strip_timestamp(l)).collect();

    assert_eq!(
        messages.iter().filter(|m| m.starts_with("[Direct] Attach thread 1 ")).count(),
        1
    );
    assert!(messages.contains(&"[APC] Thread 2 SetCurrentThreadCompartmentId(3) => 0"));
    assert!(messages.contains(&"[APC] Thread 3 SetCurrentThreadCompartmentId(3) => 0"));
    assert!(messages
        .iter()
        .any(|m| m.starts_with("APC queue summary: queued=2 skipped=0")));
    assert!(messages.iter().all(|m| !m.contains("Thread 99")));
    assert_eq!(stack.sets.load(Ordering::SeqCst), 3);
    assert!(pending.queued() == 0);
}

#[test]
fn test_unopenable_thread_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cphook.log");
    let log = DiagnosticLog::open_path(&path).unwrap();

    let mut host = FakeHost::new(&[ATTACHING, 2, 3]);
    host.unopenable.push(3);
    let pending = PendingRequests::new();

    tracing::subscriber::with_default(log.subscriber(), || {
        let api: Arc<dyn CompartmentApi> = Arc::new(Stack::default());
        let summary = attach_process(&host, &pending, Some(CompartmentId(3)), || Ok(api)).unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.skipped, 1);
    });

    let lines = read_lines(&path);
    assert!(lines
        .iter()
        .any(|l| strip_timestamp(l).starts_with("APC queue summary: queued=1 skipped=1")));
    assert_eq!(pending.queued(), 1);
    assert_eq!(pending.abandon_outstanding(), 1);
    assert_eq!(pending.queued(), 0);
}

#[test]
fn test_no_target_writes_skip_notice_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cphook.log");
    let log = DiagnosticLog::open_path(&path).unwrap();
    let host = FakeHost::new(&[ATTACHING, 2]);
    let pending = PendingRequests::new();

    tracing::subscriber::with_default(log.subscriber(), || {
        let summary = attach_process(&host, &pending, None, || -> Result<Arc<dyn CompartmentApi>> {
            panic!("stack must not be loaded without a target")
        });
        assert!(summary.is_none());
    });

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1);
    assert!(strip_timestamp(&lines[0]).starts_with("[Attach] No COMPARTMENT_ID_ATTACH set"));
    assert!(host.queued.lock().is_empty());
}

#[test]
fn test_no_log_path_means_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = HookConfig::from_lookup(|_| None);
    assert!(DiagnosticLog::open(&config).is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
