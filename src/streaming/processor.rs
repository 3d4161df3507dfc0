// Running power spectrum of FA data
//
// Each update covers two consecutive half blocks (50% overlap) under a half
// cosine window, so every sample contributes with total weight 1 across the
// two spectra it appears in. The FFT power is integrated with a cumulative
// sum and sampled at the requested frequencies, which condenses thousands of
// FFT bins into a handful of (typically logarithmic) bands.

use crate::streaming::source::{ChannelMask, SubscribeRequest, SubscriptionFactory};
use crate::streaming::types::{ReconnectPolicy, StreamError, StreamResult};
use ndarray::{Array3, Axis, Zip};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Geometry of a spectrum estimator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Samples per update (H); each FFT is 2H long
    pub half_block_size: usize,
    pub channel_count: usize,
    /// Upper edge of each reported band, strictly increasing, in Hz
    pub frequencies: Vec<f64>,
    /// Rate of the analysed stream, in Hz
    pub sample_frequency: f64,
}

impl SpectrumConfig {
    pub fn validate(&self) -> StreamResult<()> {
        if self.half_block_size == 0 {
            return Err(StreamError::InvalidConfig(
                "half block size must be positive".to_string(),
            ));
        }
        if self.channel_count == 0 {
            return Err(StreamError::InvalidConfig(
                "at least one channel is required".to_string(),
            ));
        }
        if !(self.sample_frequency.is_finite() && self.sample_frequency > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "sample frequency {} must be positive",
                self.sample_frequency
            )));
        }
        if self.frequencies.is_empty() {
            return Err(StreamError::InvalidConfig(
                "at least one frequency is required".to_string(),
            ));
        }
        if !self.frequencies.iter().all(|f| f.is_finite() && *f > 0.0) {
            return Err(StreamError::InvalidConfig(
                "frequencies must be positive".to_string(),
            ));
        }
        if self.frequencies.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(StreamError::InvalidConfig(
                "frequencies must be strictly increasing".to_string(),
            ));
        }
        Ok(())
    }
}

/// One spectrum update, both arrays shaped [frequencies, channels, 2]
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Power integrated from DC up to each frequency
    pub sum: Array3<f64>,
    /// Power density in each band (per Hz)
    pub power: Array3<f64>,
}

impl Spectrum {
    pub fn zeros(frequency_count: usize, channel_count: usize) -> Self {
        Self {
            sum: Array3::zeros((frequency_count, channel_count, 2)),
            power: Array3::zeros((frequency_count, channel_count, 2)),
        }
    }

    pub fn frequency_count(&self) -> usize {
        self.sum.len_of(Axis(0))
    }

    pub fn channel_count(&self) -> usize {
        self.sum.len_of(Axis(1))
    }

    /// Square root of both arrays scaled by 1e-3: nm^2 becomes um, and
    /// nm^2/Hz becomes um/sqrt(Hz).
    pub fn to_microns(&self) -> Self {
        Self {
            sum: self.sum.mapv(|v| 1e-3 * v.sqrt()),
            power: self.power.mapv(|v| 1e-3 * v.sqrt()),
        }
    }
}

/// Overlap windowed FFT power estimator
pub struct SpectrumEstimator {
    config: SpectrumConfig,
    window: Vec<f64>,
    /// Cumulative sum offsets: 0 followed by one per frequency
    bins: Vec<usize>,
    /// Width in Hz of each band
    bin_widths: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
    last: Array3<f64>,
    scratch: Vec<Complex<f64>>,
    cumulative: Vec<f64>,
}

impl SpectrumEstimator {
    pub fn new(config: SpectrumConfig) -> StreamResult<Self> {
        config.validate()?;

        let half = config.half_block_size;
        let length = 2 * half;

        let fft_frequency =
            |k: usize| 0.5 * config.sample_frequency * k as f64 / half as f64;
        let fft_frequencies: Vec<f64> = (0..half).map(fft_frequency).collect();

        let mut bins = Vec::with_capacity(config.frequencies.len() + 1);
        bins.push(0);
        for &target in &config.frequencies {
            // First FFT bin at or above target, limited to the last one
            let bin = fft_frequencies.partition_point(|&f| f < target);
            bins.push(bin.min(half - 1));
        }
        let bin_widths = bins
            .windows(2)
            .map(|pair| fft_frequencies[pair[1]] - fft_frequencies[pair[0]])
            .collect();

        // cos over linspace(-pi/2, pi/2, 2H)
        let window = (0..length)
            .map(|n| {
                let position = if length > 1 {
                    n as f64 / (length - 1) as f64
                } else {
                    0.5
                };
                (PI * (position - 0.5)).cos()
            })
            .collect();

        let fft = FftPlanner::<f64>::new().plan_fft_forward(length);
        let fft_length = bins.last().copied().unwrap_or(0) + 1;

        log::debug!(
            "Spectrum estimator: H = {}, {} channels, {} bands up to FFT bin {}",
            half,
            config.channel_count,
            config.frequencies.len(),
            fft_length - 1
        );

        Ok(Self {
            last: Array3::zeros((half, config.channel_count, 2)),
            scratch: vec![Complex::new(0.0, 0.0); length],
            cumulative: vec![0.0; fft_length],
            config,
            window,
            bins,
            bin_widths,
            fft,
        })
    }

    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    /// Cumulative sum offsets: 0 then one FFT bin per frequency
    pub fn bins(&self) -> &[usize] {
        &self.bins
    }

    pub fn bin_widths(&self) -> &[f64] {
        &self.bin_widths
    }

    /// Forgets the previous half block, as at the start of a new stream.
    pub fn reset(&mut self) {
        self.last.fill(0.0);
    }

    /// Computes the spectrum of the previous half block followed by `block`,
    /// which must be shaped [H, channels, 2].
    pub fn compute(&mut self, block: &Array3<i32>) -> StreamResult<Spectrum> {
        let half = self.config.half_block_size;
        let channels = self.config.channel_count;
        if block.shape() != [half, channels, 2] {
            return Err(StreamError::InvalidConfig(format!(
                "expected a block of shape [{}, {}, 2], got {:?}",
                half,
                channels,
                block.shape()
            )));
        }

        let frequency_count = self.config.frequencies.len();
        let mut spectrum = Spectrum::zeros(frequency_count, channels);
        let normalise = 4.0 / (2.0 * half as f64).powi(2);

        for c in 0..channels {
            for axis in 0..2 {
                for n in 0..half {
                    self.scratch[n] = Complex::new(self.last[[n, c, axis]] * self.window[n], 0.0);
                    self.scratch[half + n] = Complex::new(
                        f64::from(block[[n, c, axis]]) * self.window[half + n],
                        0.0,
                    );
                }
                self.fft.process(&mut self.scratch);

                // DC is excluded from the integration
                let mut total = 0.0;
                for (k, cumulative) in self.cumulative.iter_mut().enumerate() {
                    if k > 0 {
                        total += self.scratch[k].norm_sqr();
                    }
                    *cumulative = total;
                }

                for i in 0..frequency_count {
                    let lower = normalise * self.cumulative[self.bins[i]];
                    let upper = normalise * self.cumulative[self.bins[i + 1]];
                    spectrum.sum[[i, c, axis]] = upper;
                    let width = self.bin_widths[i];
                    spectrum.power[[i, c, axis]] = if width > 0.0 {
                        (upper - lower) / width
                    } else {
                        0.0
                    };
                }
            }
        }

        Zip::from(&mut self.last)
            .and(block)
            .for_each(|last, &value| *last = f64::from(value));
        Ok(spectrum)
    }
}

/// Averages successive spectra in groups of `target_count`
#[derive(Debug, Clone)]
pub struct RunningMean {
    total: Option<Spectrum>,
    count: u32,
    target_count: u32,
}

impl RunningMean {
    pub fn new(target_count: u32) -> Self {
        Self {
            total: None,
            count: 0,
            target_count: target_count.max(1),
        }
    }

    /// Adds `spectrum`; returns the mean once `target_count` have been added.
    pub fn accumulate(&mut self, spectrum: &Spectrum) -> Option<Spectrum> {
        let total = match self.total.take() {
            Some(mut total) if total.sum.shape() == spectrum.sum.shape() => {
                total.sum += &spectrum.sum;
                total.power += &spectrum.power;
                total
            }
            _ => {
                self.count = 0;
                spectrum.clone()
            }
        };
        self.total = Some(total);
        self.count += 1;

        if self.count < self.target_count {
            return None;
        }
        let count = f64::from(self.count);
        let mean = self.total.take().map(|total| Spectrum {
            sum: total.sum / count,
            power: total.power / count,
        });
        self.count = 0;
        mean
    }

    pub fn set_target_count(&mut self, target_count: u32) {
        self.target_count = target_count.max(1);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.total = None;
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn target_count(&self) -> u32 {
        self.target_count
    }
}

/// Runtime controls shared with a running `SpectrumProcessor`
#[derive(Debug, Clone)]
pub struct SpectrumControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    target_count: AtomicU32,
    enabled: AtomicBool,
    threshold: AtomicU64,
    mean_count: AtomicU32,
}

impl SpectrumControl {
    pub fn new(target_count: u32) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                target_count: AtomicU32::new(target_count.max(1)),
                enabled: AtomicBool::new(true),
                threshold: AtomicU64::new(0f64.to_bits()),
                mean_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn target_count(&self) -> u32 {
        self.inner.target_count.load(Ordering::Relaxed)
    }

    /// Takes effect on the next update and restarts the current mean.
    pub fn set_target_count(&self, target_count: u32) {
        self.inner
            .target_count
            .store(target_count.max(1), Ordering::Relaxed);
    }

    /// Whether updates are accumulated into the mean
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.inner.enabled.swap(enabled, Ordering::Relaxed) != enabled {
            log::info!(
                "Spectrum accumulation {}",
                if enabled { "running" } else { "paused" }
            );
        }
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.inner.threshold.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: f64) {
        self.inner
            .threshold
            .store(threshold.to_bits(), Ordering::Relaxed);
    }

    /// Gates accumulation on a qualifier reading (e.g. beam current): the
    /// mean only runs while `value` is above the threshold.
    pub fn update_qualifier(&self, value: f64) {
        self.set_enabled(value > self.threshold());
    }

    /// Updates accumulated into the mean in progress
    pub fn mean_count(&self) -> u32 {
        self.inner.mean_count.load(Ordering::Relaxed)
    }
}

type SpectrumCallback = Box<dyn Fn(&Spectrum) + Send + Sync>;

/// Drives a decimated subscription through a `SpectrumEstimator`
pub struct SpectrumProcessor {
    factory: Arc<dyn SubscriptionFactory>,
    request: SubscribeRequest,
    estimator: SpectrumEstimator,
    mean: RunningMean,
    control: SpectrumControl,
    on_update: SpectrumCallback,
    on_mean: SpectrumCallback,
    updates: u64,
}

impl SpectrumProcessor {
    pub fn new(
        factory: Arc<dyn SubscriptionFactory>,
        mask: ChannelMask,
        config: SpectrumConfig,
        control: SpectrumControl,
    ) -> StreamResult<Self> {
        if config.channel_count != mask.count() {
            return Err(StreamError::InvalidConfig(format!(
                "spectrum configured for {} channels but mask selects {}",
                config.channel_count,
                mask.count()
            )));
        }
        let estimator = SpectrumEstimator::new(config)?;

        Ok(Self {
            factory,
            request: SubscribeRequest::new(mask).decimated(true),
            estimator,
            mean: RunningMean::new(control.target_count()),
            control,
            on_update: Box::new(|_: &Spectrum| {}),
            on_mean: Box::new(|_: &Spectrum| {}),
            updates: 0,
        })
    }

    /// Called with every spectrum update
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Spectrum) + Send + Sync + 'static,
    {
        self.on_update = Box::new(callback);
        self
    }

    /// Called with each completed mean spectrum
    pub fn on_mean<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Spectrum) + Send + Sync + 'static,
    {
        self.on_mean = Box::new(callback);
        self
    }

    pub fn control(&self) -> &SpectrumControl {
        &self.control
    }

    /// Spectrum updates produced so far, across all runs
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// One subscription: returns Ok when cancelled, otherwise the error that
    /// ended the stream.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> StreamResult<()> {
        self.estimator.reset();
        self.mean.reset();
        self.control.inner.mean_count.store(0, Ordering::Relaxed);

        let mut source = self.factory.subscribe(&self.request).await?;
        log::info!(
            "Spectrum run started for {} ids",
            self.request.mask.count()
        );

        let half = self.estimator.config().half_block_size;
        let result = loop {
            let read = tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                read = source.read(half) => read,
            };
            let block = match read {
                Ok(block) => block,
                Err(e) => break Err(e),
            };
            if let Err(e) = self.update(&block.data) {
                break Err(e);
            }
        };

        source.close().await;
        result
    }

    fn update(&mut self, block: &Array3<i32>) -> StreamResult<()> {
        let spectrum = self.estimator.compute(block)?;
        self.updates += 1;
        (self.on_update)(&spectrum);

        if self.control.is_enabled() {
            let target = self.control.target_count();
            if target != self.mean.target_count() {
                self.mean.set_target_count(target);
            }
            if let Some(mean) = self.mean.accumulate(&spectrum) {
                log::debug!("Mean spectrum over {} updates", target);
                (self.on_mean)(&mean);
            }
        } else {
            self.mean.reset();
        }
        self.control
            .inner
            .mean_count
            .store(self.mean.count(), Ordering::Relaxed);
        Ok(())
    }

    /// Runs until cancelled, resubscribing after failures as `policy` allows.
    ///
    /// A run that produced at least one update resets the failure count.
    pub async fn run(
        &mut self,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> StreamResult<()> {
        let mut failures = 0;
        loop {
            let updates_before = self.updates;
            let error = match self.run_once(&cancel).await {
                Ok(()) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => e,
            };

            if self.updates > updates_before {
                failures = 0;
            }
            failures += 1;
            log::warn!("Spectrum run failed: {}", error);

            let Some(delay) = policy.next_delay(failures) else {
                log::error!("Giving up after {} failed runs", failures);
                return Err(error);
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
