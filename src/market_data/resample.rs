// =============================================================================
// OHLCV Resampler — 1m base bars into higher timeframes
// =============================================================================

use super::cache::OhlcvArrays;

/// Aggregate 1-minute arrays into `timeframe_minutes` buckets.
///
/// Buckets are aligned to `floor(time / (timeframe * 60))`; each bucket takes
/// the first open, max high, min low, last close, and summed volume. A
/// timeframe of 1 (or less) returns the input unchanged.
pub fn resample_ohlcv(base: &OhlcvArrays, timeframe_minutes: u32) -> OhlcvArrays {
    if timeframe_minutes <= 1 || base.is_empty() {
        return base.clone();
    }

    let bucket_seconds = timeframe_minutes as f64 * 60.0;
    let mut out = OhlcvArrays::default();

    let mut current_bucket: Option<i64> = None;
    let (mut open, mut high, mut low, mut close, mut vol, mut time): (f64, f64, f64, f64, f64, f64) =
        (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);

    let mut flush = |out: &mut OhlcvArrays, time, open, high, low, close, vol| {
        out.times.push(time);
        out.opens.push(open);
        out.highs.push(high);
        out.lows.push(low);
        out.closes.push(close);
        out.volumes.push(vol);
    };

    for i in 0..base.len() {
        let bucket = (base.times[i] / bucket_seconds).floor() as i64;
        match current_bucket {
            Some(b) if b == bucket => {
                high = high.max(base.highs[i]);
                low = low.min(base.lows[i]);
                close = base.closes[i];
                vol += base.volumes[i];
            }
            _ => {
                if current_bucket.is_some() {
                    flush(&mut out, time, open, high, low, close, vol);
                }
                current_bucket = Some(bucket);
                time = bucket as f64 * bucket_seconds;
                open = base.opens[i];
                high = base.highs[i];
                low = base.lows[i];
                close = base.closes[i];
                vol = base.volumes[i];
            }
        }
    }
    if current_bucket.is_some() {
        flush(&mut out, time, open, high, low, close, vol);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_minute_series(n: usize) -> OhlcvArrays {
        let mut out = OhlcvArrays::default();
        for i in 0..n {
            let price = 100.0 + i as f64;
            out.times.push(i as f64 * 60.0);
            out.opens.push(price);
            out.highs.push(price + 0.5);
            out.lows.push(price - 0.5);
            out.closes.push(price + 0.25);
            out.volumes.push(10.0);
        }
        out
    }

    #[test]
    fn timeframe_one_is_identity() {
        let base = one_minute_series(10);
        let out = resample_ohlcv(&base, 1);
        assert_eq!(out.closes, base.closes);
    }

    #[test]
    fn five_minute_buckets() {
        let base = one_minute_series(10);
        let out = resample_ohlcv(&base, 5);
        assert_eq!(out.len(), 2);
        // First bucket: bars 0..5.
        assert_eq!(out.opens[0], 100.0);
        assert_eq!(out.highs[0], 104.5);
        assert_eq!(out.lows[0], 99.5);
        assert_eq!(out.closes[0], 104.25);
        assert_eq!(out.volumes[0], 50.0);
        // Second bucket: bars 5..10.
        assert_eq!(out.opens[1], 105.0);
        assert_eq!(out.closes[1], 109.25);
    }

    #[test]
    fn partial_trailing_bucket_kept() {
        let base = one_minute_series(7);
        let out = resample_ohlcv(&base, 5);
        assert_eq!(out.len(), 2);
        assert_eq!(out.volumes[1], 20.0);
    }

    #[test]
    fn empty_input() {
        let out = resample_ohlcv(&OhlcvArrays::default(), 5);
        assert!(out.is_empty());
    }

    #[test]
    fn bucket_times_aligned() {
        let base = one_minute_series(10);
        let out = resample_ohlcv(&base, 5);
        assert_eq!(out.times[0], 0.0);
        assert_eq!(out.times[1], 300.0);
    }
}
