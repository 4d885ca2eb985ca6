//! Daily OHLCV bucket

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Price/volume values one row contributes to a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Sample {
    /// A single trade: every price component is the trade price
    pub fn trade(price: f64, quantity: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
        }
    }
}

/// Arrival stamp ordering rows that share a timestamp
pub type Stamp = (Timestamp, u64);

/// Aggregate of one entity over one UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub entity: String,
    /// Midnight UTC of the day
    pub day: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Rows folded into the bucket
    pub bars: u64,
    /// Stamp of the row `open` came from
    pub open_stamp: Stamp,
    /// Stamp of the row `close` came from
    pub close_stamp: Stamp,
}

impl DailyBucket {
    pub fn seed(entity: &str, day: Timestamp, stamp: Stamp, sample: Sample) -> Self {
        Self {
            entity: entity.to_string(),
            day,
            open: sample.open,
            high: sample.high,
            low: sample.low,
            close: sample.close,
            volume: sample.volume,
            bars: 1,
            open_stamp: stamp,
            close_stamp: stamp,
        }
    }

    /// Fold one more row in. Arrival order does not matter: the result
    /// equals folding every row sorted by stamp.
    pub fn merge(&mut self, stamp: Stamp, sample: Sample) {
        if stamp < self.open_stamp {
            self.open = sample.open;
            self.open_stamp = stamp;
        }
        if stamp > self.close_stamp {
            self.close = sample.close;
            self.close_stamp = stamp;
        }
        self.high = self.high.max(sample.high);
        self.low = self.low.min(sample.low);
        self.volume += sample.volume;
        self.bars += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open: f64, high: f64, low: f64, close: f64) -> Sample {
        Sample {
            open,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn test_merge_out_of_order() {
        let mut bucket = DailyBucket::seed("AAPL", 0, (9, 0), sample(10.0, 11.0, 8.5, 10.5));
        bucket.merge((16, 1), sample(11.0, 12.5, 10.0, 12.0));
        bucket.merge((8, 2), sample(9.0, 9.5, 9.0, 9.2));

        assert_eq!(bucket.open, 9.0);
        assert_eq!(bucket.high, 12.5);
        assert_eq!(bucket.low, 8.5);
        assert_eq!(bucket.close, 12.0);
        assert_eq!(bucket.volume, 300.0);
        assert_eq!(bucket.bars, 3);
    }

    #[test]
    fn test_same_time_uses_arrival_order() {
        let mut bucket = DailyBucket::seed("ES", 0, (5, 0), Sample::trade(100.0, 1.0));
        bucket.merge((5, 1), Sample::trade(101.0, 2.0));
        assert_eq!(bucket.open, 100.0);
        assert_eq!(bucket.close, 101.0);
        assert_eq!(bucket.volume, 3.0);
    }
}
