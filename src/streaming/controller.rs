// Stream monitor - keeps a rolling window of one channel up to date
//
// The monitor manages:
// - Subscription lifecycle (subscribe, read loop, close)
// - The rolling buffer and the notify/update geometry
// - Connect / data / end-of-stream callbacks
// - Cooperative stop: the running flag is checked between reads, then join
//
// Stop never interrupts a read in progress. A read that hangs ends with the
// source's receive timeout and takes the end-of-stream path.
//
// `BlockPump` is the lower level variant for consumers that want whole blocks
// through a bounded queue instead of a rolling window.

use crate::config::{validate_sizes, MonitorConfig};
use crate::streaming::{
    buffer::{BlockQueue, RollingBuffer},
    source::{ChannelMask, MaskEncoding, SampleBlock, SampleSource, SubscribeRequest, SubscriptionFactory},
    types::{MonitorState, MonitorStats, StreamError, StreamResult},
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reason reported to `on_eof` after `stop()`
pub const STOPPED_REASON: &str = "Stopped";

type DataCallback = Box<dyn Fn(&[[i32; 2]]) + Send + Sync>;
type ConnectCallback = Box<dyn Fn() + Send + Sync>;
type EofCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Callbacks invoked by a monitor run
///
/// `on_data` and `on_eof` run on the background task; keep them short.
pub struct MonitorCallbacks {
    on_data: DataCallback,
    on_connect: ConnectCallback,
    on_eof: EofCallback,
}

impl MonitorCallbacks {
    pub fn new<D, C, E>(on_data: D, on_connect: C, on_eof: E) -> Self
    where
        D: Fn(&[[i32; 2]]) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
        E: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_connect: Box::new(on_connect),
            on_eof: Box::new(on_eof),
        }
    }
}

/// State shared between the monitor handle and its read loop
struct Shared {
    callbacks: MonitorCallbacks,
    buffer: Mutex<RollingBuffer>,
    notify_size: AtomicUsize,
    update_size: AtomicUsize,
    state: RwLock<MonitorState>,
    is_running: AtomicBool,

    runs_started: AtomicU64,
    blocks_received: AtomicU64,
    samples_received: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: MonitorState) {
        log::debug!("Monitor state: {:?}", state);
        *self.state.write() = state;
    }

    /// Appends one block and returns the window to publish.
    fn ingest(&self, samples: &[[i32; 2]]) -> StreamResult<Vec<[i32; 2]>> {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.samples_received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        let mut buffer = self.buffer.lock();
        buffer.write(samples)?;
        Ok(buffer.read(self.notify_size.load(Ordering::Relaxed))?.to_vec())
    }
}

/// Single channel monitor
pub struct StreamMonitor {
    factory: Arc<dyn SubscriptionFactory>,
    shared: Arc<Shared>,
    channel_id: u8,
    decimated: bool,
    encoding: MaskEncoding,
    task: Option<JoinHandle<()>>,
}

impl StreamMonitor {
    pub fn new(
        factory: Arc<dyn SubscriptionFactory>,
        callbacks: MonitorCallbacks,
        config: MonitorConfig,
    ) -> StreamResult<Self> {
        config
            .validate()
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;

        let shared = Shared {
            callbacks,
            buffer: Mutex::new(RollingBuffer::new(config.buffer_capacity)?),
            notify_size: AtomicUsize::new(config.notify_size),
            update_size: AtomicUsize::new(config.update_size),
            state: RwLock::new(MonitorState::Idle),
            is_running: AtomicBool::new(false),
            runs_started: AtomicU64::new(0),
            blocks_received: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
        };

        Ok(Self {
            factory,
            shared: Arc::new(shared),
            channel_id: config.channel_id,
            decimated: config.decimated,
            encoding: config.encoding,
            task: None,
        })
    }

    fn request(&self) -> SubscribeRequest {
        SubscribeRequest::new(ChannelMask::single(self.channel_id))
            .decimated(self.decimated)
            .uncork(self.decimated)
            .encoding(self.encoding)
    }

    /// Subscribes and starts the background read loop.
    ///
    /// A failed subscription is reported through `on_eof` and returned; it is
    /// not retried.
    pub async fn start(&mut self) -> StreamResult<()> {
        if self.is_running() {
            return Err(StreamError::AlreadyRunning);
        }
        // Reap a run that ended on its own
        self.join_task().await;

        log::info!(
            "Starting monitor for FA id {} ({})",
            self.channel_id,
            if self.decimated { "decimated" } else { "full rate" }
        );
        self.shared.set_state(MonitorState::Connecting);

        let source = match self.factory.subscribe(&self.request()).await {
            Ok(source) => source,
            Err(e) => {
                let reason = format!("Unable to connect to server: {}", e);
                log::warn!("{}", reason);
                self.shared.set_state(MonitorState::Stopped {
                    reason: reason.clone(),
                });
                (self.shared.callbacks.on_eof)(&reason);
                return Err(e);
            }
        };

        self.shared.buffer.lock().reset();
        self.shared.is_running.store(true, Ordering::SeqCst);
        self.shared.runs_started.fetch_add(1, Ordering::Relaxed);
        self.shared.set_state(MonitorState::Running {
            started_at: chrono::Utc::now().timestamp(),
            channel_id: self.channel_id,
        });
        (self.shared.callbacks.on_connect)();

        let shared = Arc::clone(&self.shared);
        self.task = Some(tokio::spawn(read_loop(source, shared)));
        Ok(())
    }

    /// Asks the read loop to finish after its current read and waits for it.
    pub async fn stop(&mut self) {
        if self.task.is_none() {
            return;
        }
        log::info!("Stopping monitor for FA id {}", self.channel_id);
        self.shared.is_running.store(false, Ordering::SeqCst);
        self.join_task().await;
    }

    async fn join_task(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Monitor task failed: {}", e);
            }
        }
    }

    /// Switches channel and/or stream type, restarting a running monitor.
    pub async fn set_channel(
        &mut self,
        channel_id: Option<u8>,
        decimated: Option<bool>,
    ) -> StreamResult<()> {
        let was_running = self.is_running();
        self.stop().await;

        if let Some(id) = channel_id {
            self.channel_id = id;
        }
        if let Some(decimated) = decimated {
            self.decimated = decimated;
        }

        if was_running {
            self.start().await
        } else {
            Ok(())
        }
    }

    /// Changes the window geometry; takes effect on the next read cycle.
    pub fn resize(&self, notify_size: usize, update_size: usize) -> StreamResult<()> {
        let capacity = self.shared.buffer.lock().capacity();
        validate_sizes(capacity, notify_size, update_size)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        self.shared.notify_size.store(notify_size, Ordering::Relaxed);
        self.shared.update_size.store(update_size, Ordering::Relaxed);
        Ok(())
    }

    /// The most recent `notify_size` samples
    pub fn read(&self) -> StreamResult<Vec<[i32; 2]>> {
        let notify_size = self.shared.notify_size.load(Ordering::Relaxed);
        Ok(self.shared.buffer.lock().read(notify_size)?.to_vec())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MonitorState {
        self.shared.state.read().clone()
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            runs_started: self.shared.runs_started.load(Ordering::Relaxed),
            blocks_received: self.shared.blocks_received.load(Ordering::Relaxed),
            samples_received: self.shared.samples_received.load(Ordering::Relaxed),
        }
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn decimated(&self) -> bool {
        self.decimated
    }

    pub fn notify_size(&self) -> usize {
        self.shared.notify_size.load(Ordering::Relaxed)
    }

    pub fn update_size(&self) -> usize {
        self.shared.update_size.load(Ordering::Relaxed)
    }
}

impl Drop for StreamMonitor {
    fn drop(&mut self) {
        // The loop notices after its current read and closes its subscription
        self.shared.is_running.store(false, Ordering::SeqCst);
    }
}

async fn read_loop(mut source: Box<dyn SampleSource>, shared: Arc<Shared>) {
    let reason = loop {
        if !shared.is_running.load(Ordering::SeqCst) {
            break STOPPED_REASON.to_string();
        }
        let update_size = shared.update_size.load(Ordering::Relaxed);

        let block = match source.read(update_size).await {
            Ok(block) => block,
            Err(e) => break e.to_string(),
        };
        // A single id mask always yields exactly one column
        let Some(samples) = block.channel(0) else {
            break "Server returned no channels".to_string();
        };
        match shared.ingest(&samples) {
            Ok(window) => (shared.callbacks.on_data)(&window),
            Err(e) => break e.to_string(),
        }
    };

    source.close().await;
    shared.is_running.store(false, Ordering::SeqCst);
    if reason == STOPPED_REASON {
        log::info!("Monitor run stopped");
    } else {
        log::warn!("Monitor run ended: {}", reason);
    }
    shared.set_state(MonitorState::Stopped {
        reason: reason.clone(),
    });
    (shared.callbacks.on_eof)(&reason);
}

/// Reads fixed size blocks from a source into a bounded queue until cancelled
/// or the stream fails. A full queue drops blocks, the reader never waits.
pub struct BlockPump {
    queue: Arc<BlockQueue<SampleBlock>>,
    cancel_token: CancellationToken,
    task: JoinHandle<StreamResult<()>>,
}

impl BlockPump {
    pub fn spawn(
        mut source: Box<dyn SampleSource>,
        block_size: usize,
        queue: Arc<BlockQueue<SampleBlock>>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let sink = Arc::clone(&queue);

        let task = tokio::spawn(async move {
            let result = loop {
                let read = tokio::select! {
                    biased;

                    _ = token.cancelled() => break Ok(()),

                    read = source.read(block_size) => read,
                };
                match read {
                    Ok(block) => {
                        sink.push(block);
                    }
                    Err(e) => {
                        log::warn!("Block pump stopped: {}", e);
                        break Err(e);
                    }
                }
            };
            source.close().await;
            result
        });

        Self {
            queue,
            cancel_token,
            task,
        }
    }

    pub fn queue(&self) -> &Arc<BlockQueue<SampleBlock>> {
        &self.queue
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// True once the pump has stopped reading
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the pump and returns the error that ended it, if any.
    pub async fn stop(self) -> StreamResult<()> {
        self.cancel_token.cancel();
        self.task
            .await
            .map_err(|e| StreamError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::buffer::OverflowStrategy;
    use crate::streaming::source::testing::RampFactory;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        windows: Mutex<Vec<Vec<[i32; 2]>>>,
        connects: AtomicUsize,
        eofs: Mutex<Vec<String>>,
        /// Callback order: "data" and "eof"
        events: Mutex<Vec<&'static str>>,
    }

    fn callbacks(recorder: &Arc<Recorder>) -> MonitorCallbacks {
        let data = Arc::clone(recorder);
        let connect = Arc::clone(recorder);
        let eof = Arc::clone(recorder);
        MonitorCallbacks::new(
            move |window| {
                data.windows.lock().push(window.to_vec());
                data.events.lock().push("data");
            },
            move || {
                connect.connects.fetch_add(1, Ordering::SeqCst);
            },
            move |reason| {
                eof.eofs.lock().push(reason.to_string());
                eof.events.lock().push("eof");
            },
        )
    }

    fn config(channel_id: u8) -> MonitorConfig {
        MonitorConfig {
            channel_id,
            decimated: false,
            buffer_capacity: 4096,
            update_size: 1000,
            notify_size: 500,
            encoding: MaskEncoding::RangeList,
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn ramp(start: i32, len: i32) -> Vec<[i32; 2]> {
        (start..start + len).map(|v| [v, -v]).collect()
    }

    #[tokio::test]
    async fn test_monitor_delivers_newest_window() {
        let factory = Arc::new(RampFactory::endless());
        let recorder = Arc::new(Recorder::default());
        let mut monitor =
            StreamMonitor::new(factory.clone(), callbacks(&recorder), config(5)).unwrap();

        monitor.start().await.unwrap();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        wait_for(|| recorder.windows.lock().len() >= 2).await;
        monitor.stop().await;

        let windows = recorder.windows.lock();
        assert_eq!(windows[0], ramp(500, 500));
        assert_eq!(windows[1], ramp(1500, 500));
        assert_eq!(*recorder.eofs.lock(), vec![STOPPED_REASON.to_string()]);

        let requests = factory.requests.lock();
        assert_eq!(requests[0].mask, ChannelMask::single(5));
        assert!(!requests[0].flags.decimated);
        assert_eq!(factory.closes(), 1);

        assert!(!monitor.is_running());
        assert_eq!(
            monitor.state(),
            MonitorState::Stopped {
                reason: STOPPED_REASON.to_string()
            }
        );
        let stats = monitor.stats();
        assert_eq!(stats.runs_started, 1);
        assert!(stats.blocks_received >= 2);
        assert_eq!(stats.samples_received, stats.blocks_received * 1000);
    }

    #[tokio::test]
    async fn test_monitor_stream_end_reports_eof() {
        let factory = Arc::new(RampFactory::with_reads(2));
        let recorder = Arc::new(Recorder::default());
        let mut monitor =
            StreamMonitor::new(factory.clone(), callbacks(&recorder), config(1)).unwrap();

        monitor.start().await.unwrap();
        wait_for(|| !recorder.eofs.lock().is_empty()).await;

        assert_eq!(
            *recorder.eofs.lock(),
            vec!["Connection closed by server".to_string()]
        );
        assert_eq!(recorder.windows.lock().len(), 2);
        assert!(!monitor.is_running());
        assert_eq!(factory.closes(), 1);

        // The last window stays readable after the run ended
        assert_eq!(monitor.read().unwrap(), ramp(1500, 500));

        // A finished monitor can be started again
        monitor.start().await.unwrap();
        assert_eq!(monitor.stats().runs_started, 2);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_connect_failure() {
        let factory = Arc::new(RampFactory::rejecting("bad mask"));
        let recorder = Arc::new(Recorder::default());
        let mut monitor = StreamMonitor::new(factory, callbacks(&recorder), config(1)).unwrap();

        let err = monitor.start().await.unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
        assert_eq!(
            *recorder.eofs.lock(),
            vec!["Unable to connect to server: bad mask".to_string()]
        );
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_monitor_already_running() {
        let recorder = Arc::new(Recorder::default());
        let mut monitor = StreamMonitor::new(
            Arc::new(RampFactory::endless()),
            callbacks(&recorder),
            config(1),
        )
        .unwrap();

        monitor.start().await.unwrap();
        assert!(matches!(
            monitor.start().await,
            Err(StreamError::AlreadyRunning)
        ));
        monitor.stop().await;
        monitor.stop().await;
        assert_eq!(recorder.eofs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_set_channel_restarts() {
        let factory = Arc::new(RampFactory::endless());
        let recorder = Arc::new(Recorder::default());
        let mut monitor =
            StreamMonitor::new(factory.clone(), callbacks(&recorder), config(3)).unwrap();

        monitor.start().await.unwrap();
        monitor.set_channel(Some(9), Some(true)).await.unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.channel_id(), 9);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 2);

        {
            let requests = factory.requests.lock();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[1].mask, ChannelMask::single(9));
            assert!(requests[1].flags.decimated);
            assert!(requests[1].flags.uncork);
        }

        monitor.stop().await;
        assert_eq!(recorder.eofs.lock().len(), 2);

        // Not running: only the settings change
        monitor.set_channel(Some(4), None).await.unwrap();
        assert!(!monitor.is_running());
        assert_eq!(factory.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_resize() {
        let recorder = Arc::new(Recorder::default());
        let monitor = StreamMonitor::new(
            Arc::new(RampFactory::endless()),
            callbacks(&recorder),
            config(1),
        )
        .unwrap();

        assert!(matches!(
            monitor.resize(5000, 10),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(monitor.resize(100, 0).is_err());

        monitor.resize(100, 50).unwrap();
        assert_eq!(monitor.notify_size(), 100);
        assert_eq!(monitor.update_size(), 50);
        assert_eq!(monitor.read().unwrap(), vec![[0, 0]; 100]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_read_in_progress() {
        let factory = Arc::new(RampFactory::slow(Duration::from_millis(200)));
        let recorder = Arc::new(Recorder::default());
        let mut monitor =
            StreamMonitor::new(factory.clone(), callbacks(&recorder), config(2)).unwrap();

        monitor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        // The read already underway completed and was delivered
        assert_eq!(recorder.windows.lock().len(), 1);
        assert_eq!(recorder.windows.lock()[0], ramp(500, 500));
        assert_eq!(*recorder.events.lock(), vec!["data", "eof"]);
        assert_eq!(*recorder.eofs.lock(), vec![STOPPED_REASON.to_string()]);
        assert_eq!(monitor.stats().blocks_received, 1);
        assert_eq!(factory.closes(), 1);
    }

    #[tokio::test]
    async fn test_resize_while_running() {
        let recorder = Arc::new(Recorder::default());
        let mut monitor = StreamMonitor::new(
            Arc::new(RampFactory::endless()),
            callbacks(&recorder),
            config(1),
        )
        .unwrap();

        monitor.start().await.unwrap();
        wait_for(|| !recorder.windows.lock().is_empty()).await;
        monitor.resize(200, 300).unwrap();
        wait_for(|| {
            recorder
                .windows
                .lock()
                .iter()
                .filter(|window| window.len() == 200)
                .count()
                >= 3
        })
        .await;
        monitor.stop().await;

        let windows = recorder.windows.lock();
        assert_eq!(windows[0].len(), 500);
        let resized: Vec<&Vec<[i32; 2]>> =
            windows.iter().filter(|window| window.len() == 200).collect();
        // Windows after the resize are contiguous and newest last
        for window in &resized {
            assert_eq!(window[199][0] - window[0][0], 199);
        }
        // The first resized window may still come from a read of the old
        // size; every later one follows a 300 sample read
        for pair in resized[1..].windows(2) {
            assert_eq!(pair[1][199][0] - pair[0][199][0], 300);
        }
        // Nothing reverted to the old geometry once resized
        let first_resized = windows.iter().position(|window| window.len() == 200).unwrap();
        assert!(windows[first_resized..].iter().all(|window| window.len() == 200));
    }

    #[tokio::test]
    async fn test_block_pump_drops_when_full() {
        let factory = RampFactory::with_reads(5);
        let source = factory
            .subscribe(&SubscribeRequest::new(ChannelMask::single(2)))
            .await
            .unwrap();
        let queue = Arc::new(BlockQueue::new(1, OverflowStrategy::DropNewest).unwrap());

        let pump = BlockPump::spawn(source, 16, Arc::clone(&queue));
        wait_for(|| pump.is_finished()).await;
        assert!(matches!(pump.stop().await, Err(StreamError::Eof)));

        let metrics = queue.metrics();
        assert_eq!(metrics.total_pushed, 1);
        assert_eq!(metrics.total_dropped, 4);
        let first = queue.pop().unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first.data[[0, 0, 0]], 0);
        assert_eq!(factory.closes(), 1);
    }

    #[tokio::test]
    async fn test_block_pump_cancel() {
        let factory = RampFactory::endless();
        let source = factory
            .subscribe(&SubscribeRequest::new(ChannelMask::single(2)))
            .await
            .unwrap();
        let queue = Arc::new(BlockQueue::new(2, OverflowStrategy::DropOldest).unwrap());

        let pump = BlockPump::spawn(source, 8, Arc::clone(&queue));
        wait_for(|| queue.metrics().total_pushed >= 3).await;
        pump.stop().await.unwrap();

        assert_eq!(factory.closes(), 1);
        assert!(queue.len() <= 2);
        assert!(queue.metrics().total_dropped >= 1);
    }
}
