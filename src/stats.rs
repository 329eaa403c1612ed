use serde::Serialize;

/// Descriptive statistics over a set of measurements
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample variance (n - 1 denominator), zero for a single value
    pub variance: f64,
}

impl Summary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = if count > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };

        Some(Self {
            count,
            mean,
            min,
            max,
            variance,
        })
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Spacing between consecutive timestamps
pub fn intervals(timestamps: &[f64]) -> Vec<f64> {
    timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

/// Result of timing one stream over several repetitions
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub stream: String,
    pub nominal_rate_hz: Option<f64>,
    pub repetitions: usize,
    /// Frames per second, one value per repetition
    pub rate_hz: Option<Summary>,
    /// Seconds between reported timestamps, across all repetitions
    pub interval_s: Option<Summary>,
}

impl BenchReport {
    pub fn print(&self) {
        println!("..............Benchmarking {}..............", self.stream);
        if let Some(nominal) = self.nominal_rate_hz {
            println!("Nominal sampling frequency: {} Hz", nominal);
        }
        println!("Results over {} repetitions:", self.repetitions);
        match &self.rate_hz {
            Some(rate) => {
                println!("  Mean: {:.3} Hz", rate.mean);
                println!("  Min:  {:.3} Hz", rate.min);
                println!("  Max:  {:.3} Hz", rate.max);
            }
            None => println!("  No frames received"),
        }

        if let Some(nominal) = self.nominal_rate_hz {
            println!("Expected interval between timestamps: {:.6} s", 1.0 / nominal);
        }
        if let Some(interval) = &self.interval_s {
            println!("Reported intervals:");
            println!("  Mean:   {:.6} s", interval.mean);
            println!("  Stddev: {:.6} s", interval.std_dev());
            println!("  Min:    {:.6} s", interval.min);
            println!("  Max:    {:.6} s", interval.max);
        }
    }
}
