use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::shared::frame::Frame;
use crate::video::domain::capture_backend::{
    CaptureBackend, CaptureHandle, ReadOutcome, SourceDescriptor,
};

/// Result of one [`VideoSourceController::pull`].
#[derive(Debug)]
pub enum PullOutcome {
    Frame(Frame),
    /// The source ended or dropped; pull again immediately.
    EndOfStream,
    /// The source could not be opened or produced nothing; back off first.
    RetryableError(String),
}

struct Selection {
    descriptor: SourceDescriptor,
    generation: u64,
    last_device: u32,
}

/// Shared handle on the currently selected source.
///
/// Cloned into the control surface; every [`select`](Self::select) bumps a
/// generation counter, which tells the controller its open handle is stale.
#[derive(Clone)]
pub struct SourceSelector {
    inner: Arc<Mutex<Selection>>,
}

impl SourceSelector {
    pub fn new(initial: SourceDescriptor) -> Self {
        let last_device = match initial {
            SourceDescriptor::Device(index) => index,
            SourceDescriptor::File(_) => 0,
        };
        Self {
            inner: Arc::new(Mutex::new(Selection {
                descriptor: initial,
                generation: 0,
                last_device,
            })),
        }
    }

    pub fn select(&self, descriptor: SourceDescriptor) {
        let mut selection = self.lock();
        if let SourceDescriptor::Device(index) = descriptor {
            selection.last_device = index;
        }
        selection.descriptor = descriptor;
        selection.generation += 1;
    }

    pub fn current(&self) -> SourceDescriptor {
        self.lock().descriptor.clone()
    }

    /// The device most recently selected, or the initial one.
    pub fn resume_device(&self) -> u32 {
        self.lock().last_device
    }

    fn snapshot(&self) -> (SourceDescriptor, u64) {
        let selection = self.lock();
        (selection.descriptor.clone(), selection.generation)
    }

    fn lock(&self) -> MutexGuard<'_, Selection> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Observable state of the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceState {
    pub source: SourceDescriptor,
    pub handle_open: bool,
}

struct OpenSource {
    handle: Box<dyn CaptureHandle>,
    descriptor: SourceDescriptor,
    generation: u64,
    frames_since_rewind: usize,
}

impl OpenSource {
    fn release(mut self) {
        self.handle.release();
    }
}

/// Owns the single capture handle and keeps frames flowing: reopens live
/// devices after failures, loops files, and follows source switches.
pub struct VideoSourceController {
    backend: Arc<dyn CaptureBackend>,
    selector: SourceSelector,
    open: Option<OpenSource>,
    warmup_delay: Duration,
}

impl VideoSourceController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        selector: SourceSelector,
        warmup_delay: Duration,
    ) -> Self {
        Self {
            backend,
            selector,
            open: None,
            warmup_delay,
        }
    }

    pub fn selector(&self) -> &SourceSelector {
        &self.selector
    }

    pub fn switch_to_device(&mut self, index: u32) {
        self.selector.select(SourceDescriptor::Device(index));
    }

    pub fn switch_to_file(&mut self, path: impl Into<PathBuf>) {
        self.selector.select(SourceDescriptor::File(path.into()));
    }

    pub fn state(&self) -> SourceState {
        let (source, generation) = self.selector.snapshot();
        SourceState {
            source,
            handle_open: self
                .open
                .as_ref()
                .is_some_and(|open| open.generation == generation),
        }
    }

    /// Releases the open handle, if any. The next pull reopens.
    pub fn release(&mut self) {
        if let Some(open) = self.open.take() {
            log::debug!("Releasing {}", open.descriptor);
            open.release();
        }
    }

    pub fn pull(&mut self) -> PullOutcome {
        let (descriptor, generation) = self.selector.snapshot();

        if self.open.as_ref().is_some_and(|o| o.generation != generation) {
            log::info!("Switching capture to {descriptor}");
            self.release();
        }

        if self.open.is_none() {
            match self.backend.open(&descriptor) {
                Ok(handle) => {
                    log::info!("Opened {descriptor}");
                    if !self.warmup_delay.is_zero() {
                        std::thread::sleep(self.warmup_delay);
                    }
                    self.open = Some(OpenSource {
                        handle,
                        descriptor,
                        generation,
                        frames_since_rewind: 0,
                    });
                }
                Err(e) => {
                    log::warn!("Failed to open {descriptor}: {e}");
                    return PullOutcome::RetryableError(format!("cannot open {descriptor}: {e}"));
                }
            }
        }

        let Some(open) = self.open.as_mut() else {
            return PullOutcome::RetryableError("no capture handle".into());
        };

        let failure = match open.handle.read() {
            Ok(ReadOutcome::Frame(frame)) => {
                open.frames_since_rewind += 1;
                return PullOutcome::Frame(frame);
            }
            Ok(ReadOutcome::EndOfStream) => None,
            Err(e) => Some(e.to_string()),
        };

        if open.descriptor.is_live() {
            match &failure {
                Some(e) => log::warn!("Read from {} failed: {e}; reopening", open.descriptor),
                None => log::warn!("{} stopped delivering frames; reopening", open.descriptor),
            }
            self.release();
            return PullOutcome::EndOfStream;
        }

        if open.frames_since_rewind == 0 {
            let reason = failure.unwrap_or_else(|| "no frames".to_string());
            let message = format!("{} yielded no frames: {reason}", open.descriptor);
            log::warn!("{message}");
            self.release();
            return PullOutcome::RetryableError(message);
        }

        if let Some(e) = &failure {
            log::debug!("Read from {} failed: {e}; rewinding", open.descriptor);
        }
        match open.handle.seek_to_start() {
            Ok(()) => {
                log::debug!("Looping {}", open.descriptor);
                open.frames_since_rewind = 0;
            }
            Err(e) => {
                log::warn!("Rewind of {} failed: {e}; reopening", open.descriptor);
                self.release();
            }
        }
        PullOutcome::EndOfStream
    }
}

impl Drop for VideoSourceController {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Frame,
        End,
        Fail,
    }

    /// Replays `steps`; `seek_to_start` restores the original script.
    struct ScriptedHandle {
        script: Vec<Step>,
        remaining: VecDeque<Step>,
        seek_fails: bool,
        next_index: usize,
        releases: Arc<AtomicUsize>,
    }

    impl CaptureHandle for ScriptedHandle {
        fn read(&mut self) -> Result<ReadOutcome, Box<dyn std::error::Error>> {
            match self.remaining.pop_front().unwrap_or(Step::End) {
                Step::Frame => {
                    let frame = Frame::filled(4, 4, [1, 2, 3], self.next_index);
                    self.next_index += 1;
                    Ok(ReadOutcome::Frame(frame))
                }
                Step::End => Ok(ReadOutcome::EndOfStream),
                Step::Fail => Err("decode error".into()),
            }
        }

        fn seek_to_start(&mut self) -> Result<(), Box<dyn std::error::Error>> {
            if self.seek_fails {
                return Err("not seekable".into());
            }
            self.remaining = self.script.iter().copied().collect();
            self.next_index = 0;
            Ok(())
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Each `open` pops the next script; `None` means the open fails.
    struct FakeBackend {
        opens: Mutex<VecDeque<Option<Vec<Step>>>>,
        opened: Mutex<Vec<SourceDescriptor>>,
        seek_fails: bool,
        releases: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new(opens: Vec<Option<Vec<Step>>>) -> Self {
            Self {
                opens: Mutex::new(opens.into()),
                opened: Mutex::new(Vec::new()),
                seek_fails: false,
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl CaptureBackend for FakeBackend {
        fn open(
            &self,
            source: &SourceDescriptor,
        ) -> Result<Box<dyn CaptureHandle>, Box<dyn std::error::Error>> {
            self.opened.lock().unwrap().push(source.clone());
            match self.opens.lock().unwrap().pop_front().flatten() {
                Some(script) => Ok(Box::new(ScriptedHandle {
                    remaining: script.iter().copied().collect(),
                    script,
                    seek_fails: self.seek_fails,
                    next_index: 0,
                    releases: Arc::clone(&self.releases),
                })),
                None => Err("device busy".into()),
            }
        }
    }

    fn controller(backend: &Arc<FakeBackend>, source: SourceDescriptor) -> VideoSourceController {
        VideoSourceController::new(
            Arc::clone(backend) as Arc<dyn CaptureBackend>,
            SourceSelector::new(source),
            Duration::ZERO,
        )
    }

    fn frame_index(outcome: PullOutcome) -> usize {
        match outcome {
            PullOutcome::Frame(frame) => frame.index(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_file_source_loops_from_first_frame() {
        let backend = Arc::new(FakeBackend::new(vec![Some(vec![
            Step::Frame,
            Step::Frame,
            Step::Frame,
        ])]));
        let mut ctrl = controller(&backend, SourceDescriptor::File("clip.mp4".into()));

        for _lap in 0..3 {
            assert_eq!(frame_index(ctrl.pull()), 0);
            assert_eq!(frame_index(ctrl.pull()), 1);
            assert_eq!(frame_index(ctrl.pull()), 2);
            assert!(matches!(ctrl.pull(), PullOutcome::EndOfStream));
        }
        assert_eq!(backend.open_count(), 1);
        assert!(ctrl.state().handle_open);
    }

    #[test]
    fn test_file_read_error_rewinds_like_end_of_stream() {
        let backend = Arc::new(FakeBackend::new(vec![Some(vec![Step::Frame, Step::Fail])]));
        let mut ctrl = controller(&backend, SourceDescriptor::File("clip.mp4".into()));

        assert_eq!(frame_index(ctrl.pull()), 0);
        assert!(matches!(ctrl.pull(), PullOutcome::EndOfStream));
        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(backend.open_count(), 1);
    }

    #[test]
    fn test_failed_rewind_reopens_file() {
        let mut backend = FakeBackend::new(vec![Some(vec![Step::Frame]), Some(vec![Step::Frame])]);
        backend.seek_fails = true;
        let backend = Arc::new(backend);
        let mut ctrl = controller(&backend, SourceDescriptor::File("clip.mp4".into()));

        assert_eq!(frame_index(ctrl.pull()), 0);
        assert!(matches!(ctrl.pull(), PullOutcome::EndOfStream));
        assert!(!ctrl.state().handle_open);
        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_empty_file_is_retryable() {
        let backend = Arc::new(FakeBackend::new(vec![Some(vec![])]));
        let mut ctrl = controller(&backend, SourceDescriptor::File("empty.mp4".into()));

        assert!(matches!(ctrl.pull(), PullOutcome::RetryableError(_)));
        assert!(!ctrl.state().handle_open);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_live_open_failure_is_retried_until_healthy() {
        let backend = Arc::new(FakeBackend::new(vec![
            None,
            None,
            Some(vec![Step::Frame, Step::Frame]),
        ]));
        let mut ctrl = controller(&backend, SourceDescriptor::Device(0));

        assert!(matches!(ctrl.pull(), PullOutcome::RetryableError(_)));
        assert!(matches!(ctrl.pull(), PullOutcome::RetryableError(_)));
        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(frame_index(ctrl.pull()), 1);
        assert_eq!(backend.open_count(), 3);
    }

    #[test]
    fn test_live_read_failure_releases_and_reopens() {
        let backend = Arc::new(FakeBackend::new(vec![
            Some(vec![Step::Frame, Step::Fail]),
            Some(vec![Step::Frame]),
        ]));
        let mut ctrl = controller(&backend, SourceDescriptor::Device(2));

        assert_eq!(frame_index(ctrl.pull()), 0);
        assert!(matches!(ctrl.pull(), PullOutcome::EndOfStream));
        assert!(!ctrl.state().handle_open);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);

        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_switch_releases_previous_handle_before_next_read() {
        let backend = Arc::new(FakeBackend::new(vec![
            Some(vec![Step::Frame, Step::Frame]),
            Some(vec![Step::Frame]),
        ]));
        let mut ctrl = controller(&backend, SourceDescriptor::Device(0));
        assert_eq!(frame_index(ctrl.pull()), 0);

        ctrl.switch_to_file("other.mkv");
        assert!(!ctrl.state().handle_open);
        assert_eq!(
            ctrl.state().source,
            SourceDescriptor::File("other.mkv".into())
        );

        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        let opened = backend.opened.lock().unwrap().clone();
        assert_eq!(
            opened,
            vec![
                SourceDescriptor::Device(0),
                SourceDescriptor::File("other.mkv".into())
            ]
        );
    }

    #[test]
    fn test_switch_through_shared_selector() {
        let backend = Arc::new(FakeBackend::new(vec![
            Some(vec![Step::Frame]),
            Some(vec![Step::Frame]),
        ]));
        let mut ctrl = controller(&backend, SourceDescriptor::Device(0));
        let selector = ctrl.selector().clone();
        assert_eq!(frame_index(ctrl.pull()), 0);

        selector.select(SourceDescriptor::Device(3));
        assert_eq!(frame_index(ctrl.pull()), 0);
        assert_eq!(selector.resume_device(), 3);
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_resume_device_survives_file_selection() {
        let selector = SourceSelector::new(SourceDescriptor::Device(1));
        selector.select(SourceDescriptor::File("a.mp4".into()));
        assert_eq!(selector.resume_device(), 1);
        assert_eq!(selector.current(), SourceDescriptor::File("a.mp4".into()));
    }

    #[test]
    fn test_release_and_drop_free_the_handle() {
        let backend = Arc::new(FakeBackend::new(vec![Some(vec![Step::Frame])]));
        {
            let mut ctrl = controller(&backend, SourceDescriptor::Device(0));
            assert_eq!(frame_index(ctrl.pull()), 0);
            ctrl.release();
            ctrl.release();
        }
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_real_video_file_loops() {
        use crate::video::infrastructure::ffmpeg_capture::tests::create_test_video;
        use crate::video::infrastructure::ffmpeg_capture::FfmpegCaptureBackend;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.mp4");
        create_test_video(&path, 4, 64, 48, 10);

        let backend: Arc<dyn CaptureBackend> = Arc::new(FfmpegCaptureBackend::new());
        let mut ctrl = VideoSourceController::new(
            backend,
            SourceSelector::new(SourceDescriptor::File(path)),
            Duration::ZERO,
        );

        let mut frames = 0;
        let mut loops = 0;
        for _ in 0..20 {
            match ctrl.pull() {
                PullOutcome::Frame(frame) => {
                    assert_eq!((frame.width(), frame.height()), (64, 48));
                    frames += 1;
                }
                PullOutcome::EndOfStream => loops += 1,
                PullOutcome::RetryableError(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(loops >= 2, "expected at least two loops, got {loops}");
        assert!(frames >= 8);
    }
}
