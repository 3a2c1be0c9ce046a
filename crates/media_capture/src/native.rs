//! Default-input-device capture through `cpal`, emitting 16-bit PCM chunks.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::capture::{
    CaptureError, CaptureFormat, CaptureRequest, CaptureStream, MediaCaptureDevice, SampleFormat,
};

/// Only raw PCM leaves the device, so the only container it can satisfy is wav.
pub struct CpalCaptureDevice;

#[async_trait]
impl MediaCaptureDevice for CpalCaptureDevice {
    fn supports_mime_type(&self, mime_type: &str) -> bool {
        mime_type.starts_with("audio/wav")
    }

    async fn open(&self, request: CaptureRequest) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::PermissionDenied(e.to_string()))?;

        // cpal exposes no echo-cancellation or gain controls; the request is
        // recorded for diagnostics only.
        info!(
            device = ?device.name(),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            constraints = ?request.constraints,
            "capture: opened default input device"
        );

        Ok(Box::new(CpalCaptureStream {
            format: CaptureFormat::Pcm {
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
                sample_format: SampleFormat::I16,
            },
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct CpalCaptureStream {
    format: CaptureFormat,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl CaptureStream for CpalCaptureStream {
    fn format(&self) -> &CaptureFormat {
        &self.format
    }

    fn start(
        &mut self,
        timeslice: Duration,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        // cpal streams are not Send on every platform, so the stream lives and
        // dies on its own thread.
        let worker = std::thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || {
                if let Err(err) = run_capture(tx, Arc::clone(&running), timeslice) {
                    error!("capture: input stream failed: {err}");
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        self.worker = Some(worker);
        Ok(rx)
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if tokio::task::spawn_blocking(move || worker.join())
                .await
                .is_err()
            {
                warn!("capture: worker thread join failed");
            }
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn run_capture(
    tx: mpsc::UnboundedSender<Bytes>,
    running: Arc<AtomicBool>,
    timeslice: Duration,
) -> Result<(), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::PermissionDenied(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let err_fn = |err: cpal::StreamError| error!("capture: input stream error: {err}");
    let sender = tx;
    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                send_samples(&sender, data.iter().copied());
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                send_samples(
                    &sender,
                    data.iter()
                        .map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16),
                );
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                send_samples(
                    &sender,
                    data.iter().map(|s| (i32::from(*s) - 32_768) as i16),
                );
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::Stream(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    let poll = timeslice.min(Duration::from_millis(100));
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(poll);
    }
    drop(stream);
    Ok(())
}

fn send_samples(tx: &mpsc::UnboundedSender<Bytes>, samples: impl Iterator<Item = i16>) {
    let mut chunk = Vec::new();
    for sample in samples {
        chunk.extend_from_slice(&sample.to_le_bytes());
    }
    if !chunk.is_empty() {
        let _ = tx.send(Bytes::from(chunk));
    }
}
