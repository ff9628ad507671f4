// SPDX-License-Identifier: MPL-2.0

//! The preview render loop
//!
//! Runs on its own thread and is the only code that touches the GPU device.
//! Each iteration hands every empty buffer back to the port, binds whatever
//! the port filled, draws and presents. The buffer on screen is released
//! only once the next one has been bound in its place.

use super::PreviewShared;
use super::textures::TextureSet;
use crate::backends::camera::frame_loop::LoopAction;
use crate::backends::camera::{BufferPool, BufferSink, ExchangeQueue, FrameBuffer, SendError};
use crate::constants::{FPS_LOG_INTERVAL, IDLE_REDRAW_INTERVAL};
use crate::errors::{PreviewError, PreviewResult};
use crate::gpu::GpuDevice;
use crate::scenes::{RedrawContext, Scene};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Everything the worker takes ownership of when it starts
pub struct WorkerContext {
    pub gpu: Box<dyn GpuDevice>,
    pub scene: Box<dyn Scene>,
    pub shared: Arc<PreviewShared>,
    pub pool: Arc<BufferPool>,
    pub filled: ExchangeQueue,
    pub sink: Arc<dyn BufferSink>,
}

/// Frame-rate counter logging every [`FPS_LOG_INTERVAL`]
#[derive(Debug, Default)]
pub struct FpsCounter {
    frames: u32,
    window_start: Option<Instant>,
}

impl FpsCounter {
    /// Count a frame; returns the rate when a reporting window closes
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);
        if elapsed > FPS_LOG_INTERVAL {
            let fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = Some(now);
            return Some(fps);
        }
        None
    }
}

/// GPU, scene and buffer state owned by the render thread
pub struct RenderState {
    gpu: Box<dyn GpuDevice>,
    scene: Box<dyn Scene>,
    textures: TextureSet,
    displayed: Option<FrameBuffer>,
    shared: Arc<PreviewShared>,
    pool: Arc<BufferPool>,
    filled: ExchangeQueue,
    sink: Arc<dyn BufferSink>,
    fps: FpsCounter,
}

impl RenderState {
    /// Create the window and context and initialise the scene
    pub fn init(ctx: WorkerContext) -> PreviewResult<Self> {
        let WorkerContext {
            mut gpu,
            mut scene,
            shared,
            pool,
            filled,
            sink,
        } = ctx;
        let window = shared.window();

        scene.create_native_window(gpu.as_mut(), &window)?;
        if let Err(e) = gpu.init_context(&scene.egl_config()) {
            scene.destroy_native_window(gpu.as_mut());
            return Err(e.into());
        }

        let mut textures = TextureSet::new();
        let ready = textures
            .create(gpu.as_mut())
            .and_then(|()| scene.gl_init(gpu.as_mut(), &window));
        if let Err(e) = ready {
            textures.delete(gpu.as_mut());
            scene.gl_term(gpu.as_mut());
            gpu.terminate_context();
            scene.destroy_native_window(gpu.as_mut());
            return Err(e.into());
        }

        info!(
            scene = scene.name(),
            width = window.native.width,
            height = window.native.height,
            "Render worker initialised"
        );
        Ok(Self {
            gpu,
            scene,
            textures,
            displayed: None,
            shared,
            pool,
            filled,
            sink,
            fps: FpsCounter::default(),
        })
    }

    /// One pass of the render loop
    pub fn iteration(&mut self) -> LoopAction {
        match self.step() {
            Ok(()) => LoopAction::Continue,
            Err(e) => {
                error!(error = %e, scene = self.scene.name(), "Preview render loop failed");
                self.shared.fail(e);
                LoopAction::Stop
            }
        }
    }

    fn step(&mut self) -> PreviewResult<()> {
        if !self.shared.stop_requested() {
            self.send_empty_buffers();
        }

        match self.filled.dequeue_timeout(IDLE_REDRAW_INTERVAL) {
            Some(first) => {
                let mut next = Some(first);
                while let Some(buffer) = next {
                    // Nothing is drawn once a stop has been requested
                    if self.shared.stop_requested() {
                        trace!(index = buffer.index(), "Releasing undrawn buffer");
                        buffer.release();
                    } else {
                        self.render_buffer(buffer)?;
                    }
                    next = self.filled.dequeue();
                }
                Ok(())
            }
            None if self.shared.stop_requested() => Ok(()),
            None => self.draw(),
        }
    }

    /// Give every empty pool buffer to the port
    fn send_empty_buffers(&mut self) {
        while let Some(buffer) = self.pool.acquire_empty() {
            if let Err(SendError { buffer, error }) = self.sink.send_buffer(buffer) {
                warn!(index = buffer.index(), error = %error, "Port refused buffer");
                buffer.release();
                break;
            }
        }
    }

    /// Bind `buffer` to every plane the scene uses, then draw
    fn render_buffer(&mut self, buffer: FrameBuffer) -> PreviewResult<()> {
        let Some(data) = buffer.data() else {
            trace!(index = buffer.index(), "Skipping buffer without payload");
            buffer.release();
            return Ok(());
        };

        for &plane in self.scene.planes() {
            if let Err(e) =
                self.scene
                    .update_texture(self.gpu.as_mut(), &mut self.textures, plane, data)
            {
                // Drop the images first so nothing references the buffer
                self.textures.destroy_images(self.gpu.as_mut());
                buffer.release();
                return Err(e.into());
            }
        }

        trace!(index = buffer.index(), sequence = buffer.sequence, "Bound camera buffer");
        if let Some(previous) = self.displayed.replace(buffer) {
            previous.release();
        }
        self.shared.count_buffer();

        self.draw()
    }

    /// Draw and present, if there is anything to draw yet
    fn draw(&mut self) -> PreviewResult<()> {
        if !self.textures.has_image() {
            return Ok(());
        }

        self.scene.update_model()?;

        let window = self.shared.window();
        let scene = &mut self.scene;
        let gpu = &mut self.gpu;
        let textures = &self.textures;
        self.shared.overlays().with_loops(|overlays| {
            scene.redraw(
                gpu.as_mut(),
                &RedrawContext {
                    window,
                    textures,
                    overlays,
                },
            )
        })?;

        let requests = self.shared.capture().take();
        if !requests.is_empty() {
            let frame = self.scene.capture(self.gpu.as_mut()).map_err(PreviewError::from);
            debug!(requests = requests.len(), ok = frame.is_ok(), "Serving capture requests");
            for reply in requests {
                let _ = reply.send(frame.clone());
            }
        }

        self.gpu.swap_buffers()?;
        self.shared.count_frame();

        if let Some(fps) = self.fps.tick(Instant::now()) {
            info!(fps = %format!("{:.2}", fps), "Preview frame rate");
        }
        Ok(())
    }

    /// Return every buffer and release every GPU object
    pub fn teardown(mut self) {
        let undrained = self.filled.release_all();

        self.textures.destroy_images(self.gpu.as_mut());
        if let Some(displayed) = self.displayed.take() {
            displayed.release();
        }
        self.textures.delete(self.gpu.as_mut());

        self.scene.gl_term(self.gpu.as_mut());
        self.gpu.terminate_context();
        self.scene.destroy_native_window(self.gpu.as_mut());

        // Pending captures will never be served
        drop(self.shared.capture().take());

        debug!(
            undrained,
            frames = self.shared.frames_drawn(),
            "Render worker torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{FrameGeometry, SendError};
    use crate::gpu::{HeadlessPresenter, SoftwareGpu, Viewport};
    use crate::pipelines::preview::port_adapter::completion_callback;
    use crate::scenes::{PassthroughScene, WindowGeometry};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const GEOMETRY: FrameGeometry = FrameGeometry::new(8, 8);

    /// Port side of the exchange: keeps every empty buffer it is given
    #[derive(Default)]
    struct HoldingSink {
        held: Mutex<VecDeque<FrameBuffer>>,
    }

    impl BufferSink for HoldingSink {
        fn send_buffer(&self, buffer: FrameBuffer) -> Result<(), SendError> {
            self.held.lock().unwrap().push_back(buffer);
            Ok(())
        }
    }

    impl HoldingSink {
        fn take(&self) -> FrameBuffer {
            self.held.lock().unwrap().pop_front().unwrap()
        }
    }

    fn render_state(
        pool: &Arc<BufferPool>,
        filled: &ExchangeQueue,
    ) -> (RenderState, Arc<HoldingSink>, Arc<PreviewShared>) {
        let shared = PreviewShared::new(WindowGeometry::from_preview(Viewport::new(0, 0, 8, 8)));
        let sink = Arc::new(HoldingSink::default());
        let state = RenderState::init(WorkerContext {
            gpu: Box::new(SoftwareGpu::new(Box::new(HeadlessPresenter::new()))),
            scene: Box::new(PassthroughScene::new()),
            shared: Arc::clone(&shared),
            pool: Arc::clone(pool),
            filled: filled.clone(),
            sink: Arc::clone(&sink) as Arc<dyn BufferSink>,
        })
        .unwrap();
        (state, sink, shared)
    }

    #[test]
    fn test_end_of_stream_releases_queued_buffers_in_order_without_drawing() {
        let pool = Arc::new(BufferPool::create(5, GEOMETRY.i420_size()).unwrap());
        let filled = ExchangeQueue::with_capacity(5);
        let (mut state, sink, shared) = render_state(&pool, &filled);
        let callback = completion_callback(filled.clone(), shared.stop_flag());

        // Idle pass: every empty buffer goes to the port, nothing to draw yet
        assert_eq!(state.iteration(), LoopAction::Continue);
        assert_eq!(pool.available(), 0);
        assert_eq!(shared.frames_drawn(), 0);

        let deliver = |sequence: u64| {
            let mut buffer = sink.take();
            buffer.fill(GEOMETRY, sequence, |bytes| bytes.fill(128)).unwrap();
            let index = buffer.index();
            callback(buffer);
            index
        };

        let first = deliver(1);
        assert_eq!(state.iteration(), LoopAction::Continue);
        assert_eq!(shared.frames_drawn(), 1);

        // Three frames queue up back to back, then the stream ends
        let queued: Vec<usize> = (2..=4).map(deliver).collect();
        let mut eos = sink.take();
        let eos_index = eos.index();
        eos.set_end_of_stream();
        callback(eos);
        assert!(shared.stop_requested());

        assert_eq!(state.iteration(), LoopAction::Continue);
        assert_eq!(shared.frames_drawn(), 1);
        assert_eq!(shared.buffers_rendered(), 1);

        // Released buffers come back out of the pool in release order
        let mut released = Vec::new();
        while let Some(buffer) = pool.acquire_empty() {
            released.push(buffer.index());
            buffer.release();
            if released.len() == 4 {
                break;
            }
        }
        let mut expected = vec![eos_index];
        expected.extend(&queued);
        assert_eq!(released, expected);

        // The frame on screen goes back last, at teardown
        assert!(!released.contains(&first));
        assert_eq!(pool.available(), 4);
        state.teardown();
        assert_eq!(pool.available(), 5);
        assert_eq!(pool.stats().hazards(), 0);
    }

    #[test]
    fn test_fps_reports_after_interval() {
        let mut fps = FpsCounter::default();
        let start = Instant::now();
        assert_eq!(fps.tick(start), None);
        for i in 1..30 {
            assert_eq!(fps.tick(start + Duration::from_millis(i * 100)), None);
        }
        let rate = fps.tick(start + FPS_LOG_INTERVAL + Duration::from_millis(1)).unwrap();
        assert!(rate > 5.0 && rate < 7.0, "{}", rate);
        assert_eq!(fps.tick(start + FPS_LOG_INTERVAL + Duration::from_millis(2)), None);
    }
}
