use crate::error::{PetalMixError, Result};
use crate::mixer::MixScheduler;
use crate::mixer::post::OutputSample;
use crate::world::PetalMixWorld;
use cpal::SizedSample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

/// Plays a world's mix on the default output device.
pub struct PetalMixEngine {
    mixer: Arc<Mutex<MixScheduler>>,
    sample_rate: u32,
    channels: u16,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_processed: Arc<AtomicUsize>,
}

impl PetalMixEngine {
    /// Create an engine that renders `world`'s mixer.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::Configuration` if the world's channel count
    /// doesn't fit a device stream.
    pub fn new(world: &PetalMixWorld) -> Result<Self> {
        let channels = u16::try_from(world.channels()).map_err(|_| {
            PetalMixError::Configuration(format!("{} output channels", world.channels()))
        })?;
        Ok(Self {
            mixer: world.mixer(),
            sample_rate: world.sample_rate(),
            channels,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
            frames_processed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Open the default output device and start mixing into it.
    ///
    /// # Errors
    ///
    /// Returns `PetalMixError::AudioDevice` if no device is available or the
    /// stream can't be built, and `PetalMixError::AudioFormat` for a device
    /// sample format the mixer can't produce.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PetalMixError::AudioDevice("No default output device available".into())
        })?;

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let default_config = device.default_output_config().map_err(|e| {
            PetalMixError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&device, &config)?,
            cpal::SampleFormat::I32 => self.create_stream::<i32>(&device, &config)?,
            cpal::SampleFormat::U32 => self.create_stream::<u32>(&device, &config)?,
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&device, &config)?,
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&device, &config)?,
            cpal::SampleFormat::I8 => self.create_stream::<i8>(&device, &config)?,
            cpal::SampleFormat::U8 => self.create_stream::<u8>(&device, &config)?,
            other => {
                return Err(PetalMixError::AudioFormat(format!(
                    "Unsupported sample format {}",
                    other
                )));
            }
        };

        stream
            .play()
            .map_err(|e| PetalMixError::AudioDevice(format!("Failed to start stream: {}", e)))?;

        log::info!(
            "Output stream started: {} Hz, {} channels, {}",
            self.sample_rate,
            self.channels,
            default_config.sample_format()
        );
        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);

        Ok(())
    }

    /// Stop the output stream. The world keeps its state and can still
    /// render offline.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            drop(stream);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Frames mixed by the device callback since creation.
    pub fn frames_processed(&self) -> usize {
        self.frames_processed.load(Ordering::Relaxed)
    }

    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + OutputSample,
    {
        let channels = usize::from(self.channels);
        let mixer = self.mixer.clone();
        let error_mixer = self.mixer.clone();
        let is_running = self.is_running.clone();
        let frames_processed = self.frames_processed.clone();

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) {
                        data.fill(T::SILENCE);
                        return;
                    }
                    let mut mixer = match mixer.try_lock() {
                        Ok(mixer) => mixer,
                        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                        Err(TryLockError::WouldBlock) => {
                            // Offline render or disconnect in progress.
                            data.fill(T::SILENCE);
                            log::warn!("Mixer busy, output {} silent frames", data.len() / channels);
                            return;
                        }
                    };
                    let frames = mixer.render_into(data, channels);
                    frames_processed.fetch_add(frames, Ordering::Relaxed);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    if let cpal::StreamError::DeviceNotAvailable = err {
                        error_mixer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .disconnect("Output device is no longer available");
                    }
                },
                None,
            )
            .map_err(|e| PetalMixError::AudioDevice(format!("Failed to build stream: {}", e)))?;

        Ok(stream)
    }
}

impl Drop for PetalMixEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
