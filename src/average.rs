use crate::error::ConfigurationError;
use heapless::Deque;

/// Upper bound on the averaging window.
pub const MAX_TALLY: usize = 64;

/// Rolling window over the last `tally` three-channel readings. An absent
/// channel value is skipped by that channel's mean.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    tally: usize,
    readings: Deque<[Option<f32>; 3], MAX_TALLY>,
}

impl RollingAverage {
    pub fn new(tally: usize) -> Result<Self, ConfigurationError> {
        if tally == 0 || tally > MAX_TALLY {
            return Err(ConfigurationError::InvalidTally(tally, MAX_TALLY));
        }

        Ok(Self {
            tally,
            readings: Deque::new(),
        })
    }

    pub fn tally(&self) -> usize {
        self.tally
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn push(&mut self, reading: [Option<f32>; 3]) {
        while self.readings.len() >= self.tally {
            self.readings.pop_front();
        }
        // capacity is at least tally, so there is room after the pops
        let _ = self.readings.push_back(reading);
    }

    pub fn reset(&mut self) {
        self.readings.clear();
    }

    pub fn mean(&self) -> [Option<f32>; 3] {
        let mut sums = [0f64; 3];
        let mut counts = [0usize; 3];

        for reading in self.readings.iter() {
            for (channel, value) in reading.iter().enumerate() {
                if let Some(v) = value {
                    sums[channel] += *v as f64;
                    counts[channel] += 1;
                }
            }
        }

        let mut out = [None; 3];
        for channel in 0..3 {
            if counts[channel] > 0 {
                out[channel] = Some((sums[channel] / counts[channel] as f64) as f32);
            }
        }
        out
    }

    /// Midpoint of the smallest and largest value per channel.
    pub fn midpoint(&self) -> [Option<f32>; 3] {
        let mut out = [None; 3];

        for (channel, slot) in out.iter_mut().enumerate() {
            let values = self.readings.iter().filter_map(|r| r[channel]);
            let (min, max) = values.fold((None::<f32>, None::<f32>), |(lo, hi), v| {
                (Some(lo.map_or(v, |l| l.min(v))), Some(hi.map_or(v, |h| h.max(v))))
            });
            if let (Some(lo), Some(hi)) = (min, max) {
                *slot = Some((lo + hi) / 2.0);
            }
        }
        out
    }
}
