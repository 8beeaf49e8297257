use std::{
    fs::{copy, create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use queues::{IsQueue, Queue};
use rscam::{Config, CID_EXPOSURE_ABSOLUTE, CID_EXPOSURE_AUTO, CID_GAIN, FIELD_NONE};
use turbojpeg::{Image as PixelImage, PixelFormat, Subsamp};

use crate::{
    common::ShutdownToken,
    error::CameraError,
    user_config::{CameraSettings, CameraTrigger},
};

const USBFS_MEMORY_PATH: &str = "/sys/module/usbcore/parameters/usbfs_memory_mb";
const THUMBNAIL_QUALITY: i32 = 85;
/// Frames read past while looking for one newer than the trigger; about a
/// second of stream at 30fps.
const MAX_STALE_FRAMES: usize = 30;

/// One frame as delivered by the camera, JPEG encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Image {
    pub(crate) data: Vec<u8>,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/**
 * What the acquisition loop needs from a camera.
 */
pub(crate) trait Camera {
    fn is_initialized(&self) -> bool;
    fn begin_acquisition(&mut self) -> Result<(), CameraError>;
    fn end_acquisition(&mut self) -> Result<(), CameraError>;
    /// First frame captured at or after `since`, the moment the board reported
    /// done. `CameraError::Incomplete` means this frame is lost but the camera
    /// is fine.
    fn acquire_image(&mut self, since: Instant) -> Result<Image, CameraError>;
    /// Stops streaming if needed and closes the device.
    fn release(&mut self);
}

/**
 * Consumer of acquired images. Handling must not block the acquisition loop.
 */
pub(crate) trait ImageHandler {
    fn handle(&mut self, image: Image, index: u32, stamp: &str);
    /// Called once at the end of a session; pending images are flushed.
    fn finish(&mut self) {}
}

/**
 * USB camera opened through V4L2. Frames are captured as MJPG so they can be
 * written to disk without re-encoding.
 */
pub(crate) struct V4l2Camera {
    device: CameraSettings,
    camera: Option<rscam::Camera>,
    streaming: bool,
    frame_clock: Option<FrameClock>,
}

/// A captured frame with the driver's timestamp (microseconds, monotonic).
#[derive(Debug, Clone)]
struct RawFrame {
    data: Vec<u8>,
    resolution: (u32, u32),
    timestamp_us: u64,
    received: Instant,
}

trait FrameSource {
    fn next_frame(&mut self) -> std::io::Result<RawFrame>;
}

/**
 * Maps instants onto frame timestamps. Anchored on a received frame; a frame
 * that arrives with less delay than the anchor replaces it, so the mapping
 * converges on the true offset.
 */
#[derive(Debug, Clone, Copy)]
struct FrameClock {
    anchor_us: u64,
    anchor: Instant,
}

/// Where saved images go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SaveTarget {
    /// Timestamped images in the run directory, thumbnails beside them.
    Run { out_dir: PathBuf, thumbs_dir: PathBuf },
    /// A single image overwritten on every capture.
    Alignment,
}

/**
 * Writes images and thumbnails. `latest_dir` always receives a copy of the
 * newest thumbnail so it can be served while a run is going.
 */
#[derive(Debug, Clone)]
pub(crate) struct ImageWriter {
    target: SaveTarget,
    latest_dir: PathBuf,
    thumbnail_width: usize,
}

#[derive(Debug, Clone)]
struct SaveJob {
    image: Image,
    index: u32,
    stamp: String,
}

/**
 * Simple blocking queue structure to move images from the acquisition loop to
 * the saver thread.
 */
struct SaveQueue {
    jobs: Mutex<Queue<SaveJob>>,
    jobs_cv: Condvar,
    closed: AtomicBool,
}

/**
 * Fire-and-forget image persistence. Images are queued and saved on a
 * background thread; failures are logged and never retried.
 */
pub(crate) struct ImageSink {
    queue: Arc<SaveQueue>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

///////////////////
// Implementations
///////////////////
impl V4l2Camera {
    pub(crate) fn open(device: CameraSettings) -> Result<Self, CameraError> {
        let mut camera = rscam::Camera::new(&device.device_path)
            .map_err(|e| CameraError::Open(device.device_path.clone(), e.to_string()))?;
        _set_v4l2_camera_controls(&mut camera, &device);
        Ok(Self {
            device,
            camera: Some(camera),
            streaming: false,
            frame_clock: None,
        })
    }

    /// Opening fails transiently right after the USB device enumerates, so try
    /// a few times before giving up.
    pub(crate) fn open_with_retry(
        device: CameraSettings,
        attempts: u32,
        delay: Duration,
        shutdown: &ShutdownToken,
    ) -> Result<Self, CameraError> {
        let mut attempt = 1;
        loop {
            match Self::open(device.clone()) {
                Ok(camera) => return Ok(camera),
                Err(e) if attempt < attempts && !shutdown.is_requested() => {
                    log::error!("{e}");
                    log::info!("Refreshing camera ({}/{})...", attempt, attempts - 1);
                    attempt += 1;
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Camera for V4l2Camera {
    fn is_initialized(&self) -> bool {
        self.camera.is_some()
    }

    fn begin_acquisition(&mut self) -> Result<(), CameraError> {
        let camera = self.camera.as_mut().ok_or(CameraError::NotInitialized)?;
        let config = Config {
            interval: (1, 30),
            resolution: self.device.resolution,
            format: b"MJPG",
            field: FIELD_NONE,
            nbuffers: self.device.buffers,
        };
        camera
            .start(&config)
            .map_err(|e| CameraError::Start(e.to_string()))?;
        self.streaming = true;

        if self.device.trigger == CameraTrigger::Software {
            let first = camera
                .next_frame()
                .map_err(|e| CameraError::Start(e.to_string()))?;
            self.frame_clock = Some(FrameClock::new(first.timestamp_us, first.received));
        }
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), CameraError> {
        let camera = self.camera.as_mut().ok_or(CameraError::NotInitialized)?;
        self.frame_clock = None;
        if self.streaming {
            self.streaming = false;
            camera.stop()?;
        }
        Ok(())
    }

    fn acquire_image(&mut self, since: Instant) -> Result<Image, CameraError> {
        let camera = self.camera.as_mut().ok_or(CameraError::NotInitialized)?;
        let frame = match self.frame_clock.as_mut() {
            Some(clock) => _next_fresh_frame(camera, clock, since, MAX_STALE_FRAMES)?,
            None => camera.next_frame()?,
        };
        _into_image(frame)
    }

    fn release(&mut self) {
        if self.streaming {
            if let Err(e) = self.end_acquisition() {
                log::error!("Failed to stop camera stream: {e}");
            }
        }
        self.camera = None;
    }
}

impl FrameSource for rscam::Camera {
    fn next_frame(&mut self) -> std::io::Result<RawFrame> {
        let frame = self.capture()?;
        Ok(RawFrame {
            data: frame.to_vec(),
            resolution: frame.resolution,
            timestamp_us: frame.get_timestamp(),
            received: Instant::now(),
        })
    }
}

impl FrameClock {
    fn new(timestamp_us: u64, received: Instant) -> Self {
        Self {
            anchor_us: timestamp_us,
            anchor: received,
        }
    }

    /// Frame timestamp corresponding to `instant`.
    fn timestamp_at(&self, instant: Instant) -> u64 {
        match instant.checked_duration_since(self.anchor) {
            Some(after) => self.anchor_us.saturating_add(after.as_micros() as u64),
            None => self
                .anchor_us
                .saturating_sub((self.anchor - instant).as_micros() as u64),
        }
    }

    fn observe(&mut self, timestamp_us: u64, received: Instant) {
        if timestamp_us > self.timestamp_at(received) {
            *self = Self::new(timestamp_us, received);
        }
    }
}

/**
 * Reads frames until one was captured at or after `since`. Anything older was
 * already queued when the board fired and does not show the event.
 */
fn _next_fresh_frame<S: FrameSource>(
    source: &mut S,
    clock: &mut FrameClock,
    since: Instant,
    max_stale: usize,
) -> Result<RawFrame, CameraError> {
    for _ in 0..=max_stale {
        let frame = source.next_frame()?;
        clock.observe(frame.timestamp_us, frame.received);
        let cutoff = clock.timestamp_at(since);
        if frame.timestamp_us >= cutoff {
            return Ok(frame);
        }
        log::debug!(
            "Dropping frame captured {}us before the trigger.",
            cutoff - frame.timestamp_us
        );
    }
    Err(CameraError::Incomplete(format!(
        "no frame newer than the trigger in {} reads",
        max_stale + 1
    )))
}

fn _into_image(frame: RawFrame) -> Result<Image, CameraError> {
    if !_is_complete_jpeg(&frame.data) {
        return Err(CameraError::Incomplete(format!(
            "truncated frame of {} bytes",
            frame.data.len()
        )));
    }
    Ok(Image {
        data: frame.data,
        width: frame.resolution.0,
        height: frame.resolution.1,
    })
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/**
 * Disable auto exposure and fix exposure and gain so every frame of a run is
 * taken under the same conditions. Not every camera has every control, so a
 * refusal is only logged. V4L2 gain is an integer control; the configured dB
 * value is rounded.
 */
fn _set_v4l2_camera_controls(camera: &mut rscam::Camera, device: &CameraSettings) {
    let controls = [
        ("auto exposure", CID_EXPOSURE_AUTO, 1),
        ("exposure", CID_EXPOSURE_ABSOLUTE, device.exposure as i32),
        ("gain", CID_GAIN, device.gain.round() as i32),
    ];
    for (name, id, value) in controls {
        log::info!("Setting camera {} to {}.", name, value);
        if let Err(e) = camera.set_control(id, &value) {
            log::warn!("Camera refused {} control: {}", name, e);
        }
    }
}

/// A complete JPEG starts with SOI and ends with EOI.
fn _is_complete_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}

impl ImageWriter {
    pub(crate) fn new(target: SaveTarget, latest_dir: PathBuf, thumbnail_width: usize) -> Self {
        Self {
            target,
            latest_dir,
            thumbnail_width,
        }
    }

    /// Writer for a run rooted at `out_dir`; thumbnails go to
    /// `<out_dir>/<out_dir name>_thumbs`.
    pub(crate) fn for_run(out_dir: PathBuf, latest_dir: PathBuf, thumbnail_width: usize) -> Self {
        let stem = out_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("run"));
        let thumbs_dir = out_dir.join(format!("{stem}_thumbs"));
        Self::new(
            SaveTarget::Run {
                out_dir,
                thumbs_dir,
            },
            latest_dir,
            thumbnail_width,
        )
    }

    fn save(&self, image: &Image, index: u32, stamp: &str) -> Result<PathBuf, CameraError> {
        create_dir_all(&self.latest_dir)?;
        let last = self.latest_dir.join("last.jpg");

        match &self.target {
            SaveTarget::Alignment => {
                let fname = self.latest_dir.join("alignment.jpg");
                log::info!("Saving image ({}) {}.", index, fname.to_string_lossy());
                write(&fname, &image.data)?;
                write(&last, make_thumbnail(&image.data, self.thumbnail_width)?)?;
                Ok(fname)
            }
            SaveTarget::Run {
                out_dir,
                thumbs_dir,
            } => {
                if !thumbs_dir.exists() {
                    log::info!("First image. Creating output directory.");
                    create_dir_all(thumbs_dir)?;
                }
                let name = _unique_name(out_dir, stamp, index);
                let fname = out_dir.join(format!("{name}.jpg"));
                log::info!(
                    "Saving {}x{} image ({}) {}.",
                    image.width,
                    image.height,
                    index,
                    fname.to_string_lossy()
                );
                write(&fname, &image.data)?;

                let thumb = thumbs_dir.join(format!("{name}_thumb.jpg"));
                write(&thumb, make_thumbnail(&image.data, self.thumbnail_width)?)?;
                copy(&thumb, &last)?;
                Ok(fname)
            }
        }
    }
}

/// Several triggers can land in the same second; keep every image.
fn _unique_name(out_dir: &Path, stamp: &str, index: u32) -> String {
    if out_dir.join(format!("{stamp}.jpg")).exists() {
        format!("{stamp}_{index}")
    } else {
        String::from(stamp)
    }
}

/**
 * Scales a JPEG down to `width` pixels wide (nearest neighbour) and
 * re-encodes it. Images already narrower than `width` are returned as is.
 */
pub(crate) fn make_thumbnail(jpeg: &[u8], width: usize) -> Result<Vec<u8>, CameraError> {
    let image = turbojpeg::decompress(jpeg, PixelFormat::RGB)?;
    if width == 0 || image.width <= width {
        return Ok(jpeg.to_vec());
    }

    let pixel_size = PixelFormat::RGB.size();
    let height = (image.height * width / image.width).max(1);
    let mut pixels = vec![0u8; width * height * pixel_size];
    for y in 0..height {
        let src_y = y * image.height / height;
        for x in 0..width {
            let src_x = x * image.width / width;
            let src = src_y * image.pitch + src_x * pixel_size;
            let dst = (y * width + x) * pixel_size;
            pixels[dst..dst + pixel_size].copy_from_slice(&image.pixels[src..src + pixel_size]);
        }
    }

    let thumbnail = PixelImage {
        pixels: &pixels[..],
        width,
        pitch: width * pixel_size,
        height,
        format: PixelFormat::RGB,
    };
    let encoded = turbojpeg::compress(thumbnail, THUMBNAIL_QUALITY, Subsamp::Sub2x2)?;
    Ok(encoded.to_vec())
}

impl ImageSink {
    pub(crate) fn start(writer: ImageWriter) -> Self {
        let queue = Arc::new(SaveQueue {
            jobs: Mutex::new(Queue::new()),
            jobs_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let thread_queue = queue.clone();
        let thread_handle = thread::spawn(move || {
            log::debug!("Starting image saver thread...");
            _save_images_until_closed(thread_queue, writer);
        });

        Self {
            queue,
            thread_handle: Some(thread_handle),
        }
    }
}

impl ImageHandler for ImageSink {
    fn handle(&mut self, image: Image, index: u32, stamp: &str) {
        let job = SaveJob {
            image,
            index,
            stamp: String::from(stamp),
        };
        {
            let mut jobs = self.queue.jobs.lock().unwrap();
            if jobs.add(job).is_err() {
                log::error!("Failed to queue image ({}) for saving.", index);
            }
        }
        self.queue.jobs_cv.notify_all();
    }

    /// Saves everything still queued, then stops the saver thread.
    fn finish(&mut self) {
        self.queue.closed.store(true, Ordering::Relaxed);
        self.queue.jobs_cv.notify_all();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Image saver thread panicked.");
            }
        }
    }
}

impl Drop for ImageSink {
    fn drop(&mut self) {
        self.finish();
    }
}

fn _save_images_until_closed(queue: Arc<SaveQueue>, writer: ImageWriter) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().unwrap();
            loop {
                if let Ok(job) = jobs.remove() {
                    break Some(job);
                }
                if queue.closed.load(Ordering::Relaxed) {
                    break None;
                }
                jobs = queue
                    .jobs_cv
                    .wait_timeout(jobs, Duration::from_millis(30))
                    .unwrap()
                    .0;
            }
        }; // jobs mutex scope

        let Some(job) = job else {
            break;
        };
        if let Err(e) = writer.save(&job.image, job.index, &job.stamp) {
            log::error!("Failed to save image ({}): {}", job.index, e);
        }
    }
}

/**
 * Large USB3 frames need more usbfs memory than the kernel default. Returns
 * whether the setting reads back as requested.
 */
pub(crate) fn set_usbfs_memory(megabytes: u32) -> std::io::Result<bool> {
    log::info!("Setting usbfs memory to {}mb.", megabytes);
    write(USBFS_MEMORY_PATH, megabytes.to_string())?;
    let current = read_to_string(USBFS_MEMORY_PATH)?;
    Ok(current.trim().parse::<u32>().ok() == Some(megabytes))
}
