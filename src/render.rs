// Render Module - Frame loop: capture, sample areas, send universes, hold the frame rate
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::artnet::Transmit;
use crate::capture::{crop, Frame, FrameSource};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::pool::{Task, WorkerPool};
use crate::sampler::AreaSampler;

// Frames to count before the first rate report
const FIRST_REPORT_AFTER: u32 = 10;
// Target spacing between later rate reports
const REPORT_INTERVAL_SECS: f64 = 5.0;

/// Knobs of the render loop
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub fps: u32,
    pub workers: usize,
    pub sampler: AreaSampler,
    /// Consecutive failed sends of one universe that end the run
    pub max_send_failures: u32,
}

impl Default for LoopOptions {
    fn default() -> Self {
        LoopOptions {
            fps: 40,
            workers: 1,
            sampler: AreaSampler::default(),
            max_send_failures: 5,
        }
    }
}

/// What one iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub sampled: usize,
    pub sent: usize,
    pub skipped: usize,
    pub processing: Duration,
    pub sleep: Duration,
}

/// Time left in the frame budget after `processing`; zero when over budget
pub fn pacing_delay(budget: Duration, processing: Duration) -> Duration {
    budget.saturating_sub(processing)
}

/// Frame budget for a target rate, whole milliseconds
pub fn frame_budget(fps: u32) -> Duration {
    Duration::from_millis(1000 / fps.max(1) as u64)
}

/// Drives the lights from the screen until told to stop
pub struct RenderLoop {
    layout: Arc<Layout>,
    source: Box<dyn FrameSource>,
    transport: Arc<dyn Transmit>,
    pool: WorkerPool,
    sampler: AreaSampler,
    frame_budget: Duration,
    send_failures: SendFailures,
    meter: UpdateMeter,
}

impl RenderLoop {
    pub fn new(
        layout: Arc<Layout>,
        source: Box<dyn FrameSource>,
        transport: Arc<dyn Transmit>,
        options: LoopOptions,
    ) -> Self {
        let pool_size =
            WorkerPool::size_for(options.workers, layout.areas.len(), layout.universes.len());
        let send_failures = SendFailures::new(options.max_send_failures, layout.universes.len());

        RenderLoop {
            pool: WorkerPool::new(pool_size),
            sampler: options.sampler,
            frame_budget: frame_budget(options.fps),
            send_failures,
            meter: UpdateMeter::new(),
            layout,
            source,
            transport,
        }
    }

    pub fn frame_budget(&self) -> Duration {
        self.frame_budget
    }

    /// Run frames until `shutdown` is raised or a frame fails fatally
    pub fn run(mut self, shutdown: &AtomicBool) -> Result<()> {
        tracing::info!(
            "Render loop running: {} areas, {} universes, {} workers, {:?} per frame",
            self.layout.areas.len(),
            self.layout.universes.len(),
            self.pool.size(),
            self.frame_budget()
        );
        tracing::debug!(
            "Sampling every {} px, ignoring brightness below {}",
            self.sampler.spacing(),
            self.sampler.threshold()
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.tick()?;
        }

        for area in &self.layout.areas {
            tracing::debug!("Area {} last color {}", area.name(), area.last_color());
        }
        tracing::info!("Render loop stopped");
        Ok(())
    }

    /// One full capture, sample, send cycle followed by the pacing sleep
    pub fn tick(&mut self) -> Result<FrameReport> {
        let frame_start = Instant::now();

        let frame = self.source.capture()?;

        let sampled = self.sample_areas(&frame)?;
        let (sent, skipped) = self.send_universes()?;

        if let Some(rate) = self.meter.record() {
            tracing::info!("{:.2} updates/sec", rate);
        }

        let processing = frame_start.elapsed();
        let sleep = pacing_delay(self.frame_budget, processing);
        tracing::trace!("Frame took {:?}, sleeping {:?}", processing, sleep);
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }

        Ok(FrameReport {
            sampled,
            sent,
            skipped,
            processing,
            sleep,
        })
    }

    fn sample_areas(&self, frame: &Arc<Frame>) -> Result<usize> {
        let tasks: Vec<Task<()>> = self
            .layout
            .areas
            .iter()
            .enumerate()
            // areas nobody listens to are not worth sampling
            .filter(|(_, area)| self.layout.mapping.devices_for(area.id()).is_some())
            .map(|(index, _)| {
                let layout = Arc::clone(&self.layout);
                let frame = Arc::clone(frame);
                let sampler = self.sampler;
                Box::new(move || sample_area(&layout, index, &frame, sampler)) as Task<()>
            })
            .collect();

        let count = tasks.len();
        for outcome in self.pool.run_batch(tasks) {
            outcome?;
        }
        Ok(count)
    }

    fn send_universes(&mut self) -> Result<(usize, usize)> {
        let tasks: Vec<Task<()>> = (0..self.layout.universes.len())
            .map(|index| {
                let layout = Arc::clone(&self.layout);
                let transport = Arc::clone(&self.transport);
                Box::new(move || {
                    let universe = &layout.universes[index];
                    transport.send(universe.address(), &universe.build_frame())
                }) as Task<()>
            })
            .collect();

        let outcomes = self.pool.run_batch(tasks);
        let (mut sent, mut skipped) = (0, 0);
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let name = self.layout.universes[index].name();
            if self.send_failures.record(index, name, outcome)? {
                sent += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((sent, skipped))
    }
}

fn sample_area(layout: &Layout, index: usize, frame: &Frame, sampler: AreaSampler) -> Result<()> {
    let area = &layout.areas[index];
    let color = sampler.average(&crop(frame, &area.rect()));
    area.set_last_color(color);

    if let Some(devices) = layout.mapping.devices_for(area.id()) {
        for device in devices {
            device.set_color(color);
        }
    }
    tracing::trace!("Area {} -> {}", area.name(), color);
    Ok(())
}

/// Per-universe consecutive send failure counter.
///
/// A failed send skips that universe for the frame; reaching the limit ends the run.
#[derive(Debug)]
pub struct SendFailures {
    limit: u32,
    consecutive: Vec<u32>,
}

impl SendFailures {
    pub fn new(limit: u32, universes: usize) -> Self {
        SendFailures {
            limit: limit.max(1),
            consecutive: vec![0; universes],
        }
    }

    /// `Ok(true)` when sent, `Ok(false)` when skipped, `Err` when the run must stop
    pub fn record(&mut self, index: usize, universe: &str, outcome: Result<()>) -> Result<bool> {
        let Some(count) = self.consecutive.get_mut(index) else {
            return outcome.map(|_| true);
        };

        match outcome {
            Ok(()) => {
                *count = 0;
                Ok(true)
            }
            Err(e @ Error::TaskPanicked(_)) => Err(e),
            Err(e) => {
                *count += 1;
                if *count >= self.limit {
                    tracing::error!(
                        "Universe {} failed {} times in a row, giving up",
                        universe,
                        count
                    );
                    return Err(e);
                }
                tracing::warn!(
                    "Skipping universe {} this frame ({}/{}): {}",
                    universe,
                    count,
                    self.limit,
                    e
                );
                Ok(false)
            }
        }
    }
}

/// Observed updates per second, reported roughly every few seconds
#[derive(Debug)]
pub struct UpdateMeter {
    iterations: u32,
    report_every: u32,
    window_start: Instant,
}

impl UpdateMeter {
    pub fn new() -> Self {
        UpdateMeter {
            iterations: 0,
            report_every: FIRST_REPORT_AFTER,
            window_start: Instant::now(),
        }
    }

    /// Count one iteration; returns the rate when a report is due
    pub fn record(&mut self) -> Option<f64> {
        self.iterations += 1;
        if self.iterations < self.report_every {
            return None;
        }

        let elapsed = self.window_start.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = self.iterations as f64 / elapsed;
        self.report_every = ((rate * REPORT_INTERVAL_SECS) as u32).max(1);
        self.iterations = 0;
        self.window_start = Instant::now();
        Some(rate)
    }
}

impl Default for UpdateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StillImage;
    use crate::dmx::{DmxFrame, UniverseAddress};
    use crate::types::{Rect, Rgb};
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const LAYOUT: &str = r#"{
        "areas": {
            "left":  {"min": {"x": 0, "y": 0},  "max": {"x": 40, "y": 30}},
            "right": {"min": {"x": 40, "y": 0}, "max": {"x": 80, "y": 30}},
            "floor": {"min": {"x": 0, "y": 30}, "max": {"x": 80, "y": 60}}
        },
        "universes": {"front": {"net": 0, "subnet": 0}, "back": {"net": 0, "subnet": 1}},
        "devices": {
            "par_left":  {"red": 0, "green": 1, "blue": 2, "statics": {"3": 255}},
            "par_right": {"red": 10, "green": 11, "blue": 12},
            "spare":     {"red": 20, "green": 21, "blue": 22}
        },
        "universes_to_devices": {"front": ["par_left", "par_right"], "back": ["spare"]},
        "areas_to_devices": {"left": ["par_left"], "right": ["par_right"]}
    }"#;

    // left half red, right half blue, bottom stripe green
    fn screen() -> RgbaImage {
        RgbaImage::from_fn(80, 60, |x, y| {
            if y >= 30 {
                Rgba([0, 200, 0, 255])
            } else if x < 40 {
                Rgba([200, 0, 0, 255])
            } else {
                Rgba([0, 0, 200, 255])
            }
        })
    }

    struct SlowSource {
        inner: StillImage,
        delay: Duration,
        captures: Arc<AtomicUsize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        fail: bool,
    }

    impl SlowSource {
        fn new(delay: Duration) -> Self {
            SlowSource {
                inner: StillImage::from_image(screen()),
                delay,
                captures: Arc::new(AtomicUsize::new(0)),
                stop_after: None,
                fail: false,
            }
        }
    }

    impl FrameSource for SlowSource {
        fn bounds(&self) -> Rect {
            self.inner.bounds()
        }

        fn capture(&mut self) -> Result<Arc<Frame>> {
            if self.fail {
                return Err(Error::Capture("display unavailable".to_string()));
            }
            let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, flag)) = &self.stop_after {
                if n >= *limit {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            thread::sleep(self.delay);
            self.inner.capture()
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(UniverseAddress, DmxFrame)>>,
        failing: Mutex<Option<UniverseAddress>>,
    }

    impl Recorder {
        fn frame_for(&self, address: UniverseAddress) -> Option<DmxFrame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(a, _)| *a == address)
                .map(|(_, f)| *f)
        }
    }

    impl Transmit for Recorder {
        fn send(&self, address: UniverseAddress, frame: &DmxFrame) -> Result<()> {
            if *self.failing.lock().unwrap() == Some(address) {
                return Err(Error::Transmit {
                    target: address.to_string(),
                    reason: "network unreachable".to_string(),
                });
            }
            self.sent.lock().unwrap().push((address, *frame));
            Ok(())
        }
    }

    fn render_loop(
        source: SlowSource,
        options: LoopOptions,
    ) -> (RenderLoop, Arc<Layout>, Arc<Recorder>) {
        let layout = Arc::new(Layout::from_json(LAYOUT).unwrap());
        let recorder = Arc::new(Recorder::default());
        let render = RenderLoop::new(
            Arc::clone(&layout),
            Box::new(source),
            Arc::clone(&recorder) as Arc<dyn Transmit>,
            options,
        );
        (render, layout, recorder)
    }

    fn options(workers: usize) -> LoopOptions {
        LoopOptions {
            workers,
            ..LoopOptions::default()
        }
    }

    #[test]
    fn test_pacing_delay() {
        let budget = frame_budget(40);
        assert_eq!(budget, Duration::from_millis(25));
        assert_eq!(pacing_delay(budget, Duration::from_millis(10)), Duration::from_millis(15));
        assert_eq!(pacing_delay(budget, Duration::from_millis(30)), Duration::ZERO);
        assert_eq!(frame_budget(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_tick_sleeps_rest_of_budget() {
        let (mut render, _, _) =
            render_loop(SlowSource::new(Duration::from_millis(10)), options(2));
        assert_eq!(render.frame_budget(), Duration::from_millis(25));

        let started = Instant::now();
        let first = render.tick().unwrap();
        render.tick().unwrap();
        let elapsed = started.elapsed();

        assert!(first.processing >= Duration::from_millis(10));
        assert!(first.sleep <= Duration::from_millis(15));
        // each frame holds the full budget before the next capture
        assert!(elapsed >= Duration::from_millis(50), "two frames took {:?}", elapsed);
    }

    #[test]
    fn test_tick_over_budget_does_not_sleep() {
        let (mut render, _, _) =
            render_loop(SlowSource::new(Duration::from_millis(30)), options(2));

        let started = Instant::now();
        let report = render.tick().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.sleep, Duration::ZERO);
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(50), "frame took {:?}", elapsed);
    }

    #[test]
    fn test_frame_reaches_devices() {
        let (mut render, layout, recorder) =
            render_loop(SlowSource::new(Duration::ZERO), options(4));
        let report = render.tick().unwrap();
        assert_eq!(report.sampled, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(report.skipped, 0);

        let front = recorder.frame_for(UniverseAddress::new(0, 0)).unwrap();
        assert_eq!(&front[0..4], &[200, 0, 0, 255]);
        assert_eq!(&front[10..13], &[0, 0, 200]);
        assert!(front[13..].iter().all(|&v| v == 0));

        assert_eq!(layout.area_named("left").unwrap().last_color(), Rgb::new(200, 0, 0));
        assert_eq!(layout.area_named("right").unwrap().last_color(), Rgb::new(0, 0, 200));
    }

    #[test]
    fn test_unmapped_area_writes_nothing() {
        let (mut render, layout, recorder) =
            render_loop(SlowSource::new(Duration::ZERO), options(1));
        let spare = layout
            .devices()
            .find(|d| d.name() == "spare")
            .cloned()
            .unwrap();
        spare.set_color(Rgb::new(1, 2, 3));

        render.tick().unwrap();

        // "floor" is green but mapped to nothing
        assert_eq!(spare.color(), Rgb::new(1, 2, 3));
        assert_eq!(layout.area_named("floor").unwrap().last_color(), Rgb::BLACK);
        let back = recorder.frame_for(UniverseAddress::new(0, 1)).unwrap();
        assert_eq!(&back[20..23], &[1, 2, 3]);
    }

    #[test]
    fn test_capture_failure_is_fatal() {
        let mut source = SlowSource::new(Duration::ZERO);
        source.fail = true;
        let (mut render, _, recorder) = render_loop(source, options(2));
        assert!(matches!(render.tick(), Err(Error::Capture(_))));
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_failures_skip_then_stop() {
        let opts = LoopOptions {
            max_send_failures: 3,
            ..options(2)
        };
        let (mut render, _, recorder) = render_loop(SlowSource::new(Duration::ZERO), opts);
        *recorder.failing.lock().unwrap() = Some(UniverseAddress::new(0, 1));

        for _ in 0..2 {
            let report = render.tick().unwrap();
            assert_eq!((report.sent, report.skipped), (1, 1));
        }
        assert!(matches!(render.tick(), Err(Error::Transmit { .. })));
    }

    #[test]
    fn test_send_success_resets_failures() {
        let mut failures = SendFailures::new(2, 1);
        let fail = || {
            Err(Error::Transmit {
                target: "node".to_string(),
                reason: "down".to_string(),
            })
        };

        assert!(!failures.record(0, "u", fail()).unwrap());
        assert!(failures.record(0, "u", Ok(())).unwrap());
        assert!(!failures.record(0, "u", fail()).unwrap());
        assert!(failures.record(0, "u", fail()).is_err());
    }

    #[test]
    fn test_panicked_send_is_fatal() {
        let mut failures = SendFailures::new(10, 1);
        let outcome = Err(Error::TaskPanicked("boom".to_string()));
        assert!(failures.record(0, "u", outcome).is_err());
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut source = SlowSource::new(Duration::ZERO);
        source.stop_after = Some((3, Arc::clone(&shutdown)));
        let captures = Arc::clone(&source.captures);

        let (render, _, recorder) = render_loop(source, LoopOptions { fps: 200, ..options(2) });
        render.run(&shutdown).unwrap();

        assert_eq!(captures.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.sent.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_update_meter_reports_after_first_window() {
        let mut meter = UpdateMeter::new();
        for _ in 0..FIRST_REPORT_AFTER - 1 {
            assert!(meter.record().is_none());
        }
        let rate = meter.record().expect("report due");
        assert!(rate > 0.0);
        assert!(meter.report_every >= 1);
        assert_eq!(meter.iterations, 0);
    }
}
