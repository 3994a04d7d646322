//! CPM quantization into ad-server price buckets.

/// One contiguous price band quantized at a fixed step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

/// Named set of price bands.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceGranularity {
    pub precision: usize,
    pub ranges: Vec<PriceRange>,
}

const fn range(min: f64, max: f64, increment: f64) -> PriceRange {
    PriceRange {
        min,
        max,
        increment,
    }
}

/// Floating point slack so 1.2 / 0.1 lands on 12 and not 11.
const EPSILON: f64 = 1e-9;

impl PriceGranularity {
    /// Looks up a granularity by name; unknown names fall back to `med`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let ranges = match name {
            "low" => vec![range(0.0, 5.0, 0.5)],
            "med" | "medium" => vec![range(0.0, 20.0, 0.1)],
            "high" => vec![range(0.0, 20.0, 0.01)],
            "auto" => vec![
                range(0.0, 5.0, 0.05),
                range(5.0, 10.0, 0.1),
                range(10.0, 20.0, 0.5),
            ],
            "dense" => vec![
                range(0.0, 3.0, 0.01),
                range(3.0, 8.0, 0.05),
                range(8.0, 20.0, 0.5),
            ],
            other => {
                log::debug!("Unknown price granularity '{}', using med", other);
                vec![range(0.0, 20.0, 0.1)]
            }
        };

        Self {
            precision: 2,
            ranges,
        }
    }

    /// Rounds `cpm` down to its bucket and formats it.
    ///
    /// Prices above the highest band cap at that band's max. Non-positive
    /// prices bucket to zero.
    #[must_use]
    pub fn bucket(&self, cpm: f64) -> String {
        let precision = self.precision;
        let Some(top) = self.ranges.iter().map(|r| r.max).reduce(f64::max) else {
            return format!("{:.precision$}", 0.0);
        };

        if !cpm.is_finite() || cpm <= 0.0 {
            return format!("{:.precision$}", 0.0);
        }
        if cpm >= top {
            return format!("{top:.precision$}");
        }

        let Some(band) = self
            .ranges
            .iter()
            .find(|r| cpm >= r.min && cpm < r.max)
        else {
            return format!("{:.precision$}", 0.0);
        };

        let steps = ((cpm - band.min) / band.increment + EPSILON).floor();
        let rounded = band.min + steps * band.increment;
        format!("{rounded:.precision$}")
    }
}
