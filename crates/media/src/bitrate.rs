/// Bitrate governance (§4.3). Recomputed whenever producer topology changes
/// and applied to every live producer/consumer transport in the room.
///
/// `raw = floor(max_outgoing / ((producer_count - 1) * factor))`, floored at
/// `min_outgoing`, then forced back up to `max_outgoing` whenever the room
/// has fewer than three producers (not enough peers for incoming bitrate
/// contention to matter).
pub fn compute_max_incoming_bitrate(
    producer_count: u32,
    max_outgoing: u32,
    min_outgoing: u32,
    factor: u32,
) -> u32 {
    if producer_count < 3 {
        return max_outgoing;
    }

    let divisor = (producer_count.saturating_sub(1)).saturating_mul(factor.max(1));
    let raw = if divisor == 0 {
        max_outgoing
    } else {
        max_outgoing / divisor
    };

    raw.max(min_outgoing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forces_max_outgoing_below_three_producers() {
        assert_eq!(compute_max_incoming_bitrate(0, 5_000_000, 100_000, 2), 5_000_000);
        assert_eq!(compute_max_incoming_bitrate(2, 5_000_000, 100_000, 2), 5_000_000);
    }

    #[test]
    fn never_drops_below_minimum_outgoing() {
        // raw = floor(5_000_000 / (19 * 2)) = 131_578, well above the floor
        assert_eq!(
            compute_max_incoming_bitrate(20, 5_000_000, 100_000, 2),
            131_578
        );
        // a huge producer count drives raw under the floor
        assert_eq!(
            compute_max_incoming_bitrate(10_000, 5_000_000, 100_000, 2),
            100_000
        );
    }

    #[test]
    fn three_producers_is_the_first_count_that_computes_raw() {
        // raw = floor(5_000_000 / (2 * 2)) = 1_250_000
        assert_eq!(
            compute_max_incoming_bitrate(3, 5_000_000, 100_000, 2),
            1_250_000
        );
    }
}
