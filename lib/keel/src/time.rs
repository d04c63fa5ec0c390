use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    duration_since_epoch().as_secs()
}

/// Millisecond unix timestamp, the resolution the id generator slices on.
#[inline]
pub fn timestamp_millis() -> u64 {
    let duration = duration_since_epoch();
    duration.as_secs() * 1_000 + u64::from(duration.subsec_millis())
}

/// Microsecond unix timestamp, the resolution of the packet `time` field.
#[inline]
pub fn timestamp_micros() -> u64 {
    let duration = duration_since_epoch();
    duration.as_secs() * 1_000_000 + u64::from(duration.subsec_micros())
}

/// Fractional-second unix timestamp, used for retransmission schedules.
#[inline]
pub fn timestamp_f64() -> f64 {
    let duration = duration_since_epoch();
    duration.as_secs() as f64 + f64::from(duration.subsec_micros()) / 1_000_000.0
}

#[inline]
fn duration_since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolutions_agree() {
        let secs = timestamp_secs();
        let millis = timestamp_millis();
        let micros = timestamp_micros();

        assert!(millis / 1_000 - secs <= 1);
        assert!(micros / 1_000_000 - secs <= 1);
    }
}
