//! CPAL-backed devices
//!
//! `cpal::Stream` is not `Send`, so every stream lives on its own thread and
//! is dropped there. Stopping a device signals that thread and joins it, which
//! guarantees no callback runs once `stop()` returns.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};

use super::meter::LevelTap;
use super::pcm::AudioBuffer;
use super::resample::resample;
use super::{AudioError, AudioHost, InputDevice, SampleCallback};
use crate::playback::{Mixer, OutputContext, UnitId};

/// Audio host talking to the platform's default CPAL host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

fn find_input(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into())),
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("input device '{}' not found", name))),
    }
}

fn find_output(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no default output device".into())),
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| {
                AudioError::DeviceUnavailable(format!("output device '{}' not found", name))
            }),
    }
}

fn build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceUnavailable("device disappeared".into())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedFormat("stream config not supported".into())
        }
        other => AudioError::StreamFailed(other.to_string()),
    }
}

/// Longest wait for a device stream to build and start playing
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Thread owning one running stream
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Spawn `build` on a fresh thread and wait until the stream is playing
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamFailed(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until asked to stop (or the owner is gone)
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamFailed(e.to_string()))?;

        match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => Ok(Self { stop_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                // Not joined: the thread exits on its own once the driver returns,
                // because `stop_tx` is dropped here
                log::error!("{} did not start within {:?}", name, STREAM_START_TIMEOUT);
                Err(AudioError::StreamFailed(format!(
                    "stream did not start within {:?}",
                    STREAM_START_TIMEOUT
                )))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(AudioError::StreamFailed("stream thread exited".into()))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("Audio stream thread panicked");
        }
    }
}

/// Microphone opened through CPAL
pub struct CpalInput {
    device_name: Option<String>,
    config: StreamConfig,
    sample_format: SampleFormat,
    thread: Option<StreamThread>,
}

impl CpalInput {
    fn build_typed<T>(
        device: &Device,
        config: &StreamConfig,
        mut on_samples: SampleCallback,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let err_fn = |err| log::error!("Audio input stream error: {}", err);
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                    on_samples(&samples);
                },
                err_fn,
                None,
            )
            .map_err(build_error)
    }
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<(), AudioError> {
        if self.thread.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        let thread = StreamThread::spawn("salesboss-capture", move || {
            let device = find_input(device_name.as_deref())?;
            match sample_format {
                SampleFormat::F32 => Self::build_typed::<f32>(&device, &config, on_samples),
                SampleFormat::I16 => Self::build_typed::<i16>(&device, &config, on_samples),
                SampleFormat::U16 => Self::build_typed::<u16>(&device, &config, on_samples),
                other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
            }
        })?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
            log::debug!("Input stream released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker output clocked by a `Mixer` that the device callback drives
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    thread: Option<StreamThread>,
}

impl CpalOutput {
    fn build_typed<T>(
        device: &Device,
        config: &StreamConfig,
        mixer: Arc<Mutex<Mixer>>,
        tap: Option<LevelTap>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let channels = config.channels as usize;
        let mut scratch: Vec<f32> = Vec::new();
        let err_fn = |err| log::error!("Audio output stream error: {}", err);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    let mix = lock_mixer(&mixer).render(&mut scratch, channels);
                    for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(value);
                    }
                    if let Some(tap) = &tap {
                        let _ = tap.try_send(mix);
                    }
                },
                err_fn,
                None,
            )
            .map_err(build_error)
    }
}

impl OutputContext for CpalOutput {
    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).current_time()
    }

    fn start_at(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) {
        let mut mixer = lock_mixer(&self.mixer);
        let samples = resample(&buffer.mixdown(), buffer.sample_rate(), mixer.sample_rate());
        mixer.schedule(id, samples, when);
    }

    fn stop(&mut self, id: UnitId) {
        lock_mixer(&self.mixer).stop(id);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        lock_mixer(&self.mixer).take_finished()
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
            lock_mixer(&self.mixer).clear();
            log::debug!("Output stream released");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioHost for CpalHost {
    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn InputDevice>, AudioError> {
        let resolved = find_input(device)?;
        log::info!(
            "Using audio input device: {:?}",
            resolved.name().unwrap_or_else(|_| "Unknown".into())
        );

        let supported = resolved.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("device disappeared".into())
            }
            other => AudioError::UnsupportedFormat(other.to_string()),
        })?;

        Ok(Box::new(CpalInput {
            device_name: device.map(str::to_string),
            sample_format: supported.sample_format(),
            config: supported.into(),
            thread: None,
        }))
    }

    fn open_output(
        &self,
        device: Option<&str>,
        tap: Option<LevelTap>,
    ) -> Result<Box<dyn OutputContext>, AudioError> {
        let resolved = find_output(device)?;
        let supported = resolved.default_output_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("device disappeared".into())
            }
            other => AudioError::UnsupportedFormat(other.to_string()),
        })?;

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        log::info!(
            "Using audio output device: {:?} ({} Hz, {} channels, {:?})",
            resolved.name().unwrap_or_else(|_| "Unknown".into()),
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0)));
        let stream_mixer = mixer.clone();
        let device_name = device.map(str::to_string);

        let thread = StreamThread::spawn("salesboss-playback", move || {
            let device = find_output(device_name.as_deref())?;
            match sample_format {
                SampleFormat::F32 => {
                    CpalOutput::build_typed::<f32>(&device, &config, stream_mixer, tap)
                }
                SampleFormat::I16 => {
                    CpalOutput::build_typed::<i16>(&device, &config, stream_mixer, tap)
                }
                other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
            }
        })?;

        Ok(Box::new(CpalOutput {
            mixer,
            thread: Some(thread),
        }))
    }
}
