//! Reservation-based bandwidth model.
//!
//! Each direction of a peer's link is a [Channel]: a timeline of how many bytes per second remain
//! unreserved from now until forever. Sending a message computes a [Charge] (how fast the message
//! can be pushed through every channel it touches, over time) and then subtracts that charge from
//! each channel. Later transfers only see what earlier ones left behind, so the total draw on a
//! channel never exceeds its capacity.
//!
//! All arithmetic is exact: volumes are tracked in billionths of a byte ("nano-bytes") so that a
//! rate in bytes/second multiplied by a span in nanoseconds is an integer. The only rounding
//! happens when a transfer finishes part-way through a nanosecond, in which case the completion
//! time is rounded up (over-reserving strictly less than one nanosecond of bandwidth).

use super::Error;
use keysim_runtime::SystemTimeExt;
use std::time::{Duration, SystemTime};

/// Number of nano-bytes in a byte (and nanoseconds in a second).
pub const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A span of constant availability.
///
/// The segment starts where the previous one ended (or at the current time for the first
/// segment) and lasts until `until` (exclusive). `None` means the segment never ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Unreserved bandwidth (in bytes/second).
    pub available: u64,

    /// Time at which the segment ends.
    pub until: Option<SystemTime>,
}

/// Availability of one direction of a peer's link over time.
///
/// Segments are ordered by strictly increasing `until` and only the final segment is unbounded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    segments: Vec<Segment>,
}

impl Channel {
    /// Create a channel with constant `capacity` (in bytes/second) forever.
    pub fn new(capacity: u64) -> Self {
        Self {
            segments: vec![Segment {
                available: capacity,
                until: None,
            }],
        }
    }

    /// Create a channel with a time-varying availability.
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self, Error> {
        let channel = Self { segments };
        channel.validate()?;
        Ok(channel)
    }

    /// Ensure the channel is well-formed.
    pub fn validate(&self) -> Result<(), Error> {
        let Some((last, rest)) = self.segments.split_last() else {
            return Err(Error::MalformedChannel);
        };
        if last.until.is_some() {
            return Err(Error::MalformedChannel);
        }
        let mut previous: Option<SystemTime> = None;
        for segment in rest {
            let Some(until) = segment.until else {
                return Err(Error::MalformedChannel);
            };
            if previous.is_some_and(|previous| previous >= until) {
                return Err(Error::MalformedChannel);
            }
            previous = Some(until);
        }
        Ok(())
    }

    /// Returns the segments of the channel.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the unreserved bandwidth at `time`.
    pub fn available_at(&self, time: SystemTime) -> u64 {
        self.segments[self.position(time)].available
    }

    /// Drop all segments that ended at or before `now`.
    pub fn prune(&mut self, now: SystemTime) {
        let position = self.position(now);
        self.segments.drain(..position);
    }

    /// Index of the segment covering `time`.
    ///
    /// Relies on the final segment being unbounded (which [Channel::validate] enforces).
    fn position(&self, time: SystemTime) -> usize {
        self.segments
            .iter()
            .position(|segment| segment.until.map_or(true, |until| until > time))
            .unwrap_or(self.segments.len().saturating_sub(1))
    }

    /// Append a segment, merging it into the last segment if availability is unchanged.
    fn push(&mut self, segment: Segment) {
        if let Some(last) = self.segments.last_mut() {
            if last.available == segment.available {
                last.until = segment.until;
                return;
            }
        }
        self.segments.push(segment);
    }
}

/// Rate drawn from every channel of a transfer until some point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Usage {
    /// Bandwidth reserved (in bytes/second).
    pub rate: u64,

    /// Time at which the usage ends (exclusive).
    pub until: SystemTime,
}

/// Bandwidth reserved by a single transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Charge {
    start: SystemTime,
    usages: Vec<Usage>,
}

impl Charge {
    /// Time at which the transfer begins.
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Consecutive usages, starting at [Charge::start].
    pub fn usages(&self) -> &[Usage] {
        &self.usages
    }

    /// Time at which the last byte has been transferred.
    pub fn completion(&self) -> SystemTime {
        self.usages.last().map_or(self.start, |usage| usage.until)
    }

    /// Volume reserved by the charge (in nano-bytes).
    pub fn transferred(&self) -> u128 {
        let mut previous = self.start;
        let mut total = 0u128;
        for usage in &self.usages {
            let elapsed = usage.until.duration_since(previous).unwrap_or_default();
            total += usage.rate as u128 * elapsed.as_nanos();
            previous = usage.until;
        }
        total
    }

    /// Append a usage, merging it into the last usage if the rate is unchanged.
    fn push(&mut self, usage: Usage) {
        if let Some(last) = self.usages.last_mut() {
            if last.rate == usage.rate {
                last.until = usage.until;
                return;
            }
        }
        self.usages.push(usage);
    }
}

/// Convert nanoseconds to a [Duration] (saturating).
fn nanos(value: u128) -> Duration {
    let secs = (value / NANOS_PER_SEC).min(u64::MAX as u128) as u64;
    let nanos = (value % NANOS_PER_SEC) as u32;
    Duration::new(secs, nanos)
}

/// Compute the charge of sending `size` bytes through all `channels`, starting at `start`.
///
/// At every instant the transfer proceeds at the minimum availability across all channels. When
/// that minimum is zero, the charge waits (reserving nothing) until the next availability change.
pub fn compute_charge(
    size: usize,
    channels: &[&Channel],
    start: SystemTime,
) -> Result<Charge, Error> {
    for channel in channels {
        channel.validate()?;
    }
    let mut charge = Charge {
        start,
        usages: Vec::new(),
    };
    if channels.is_empty() {
        return Ok(charge);
    }

    // Walk all channels in lockstep until the message is fully transferred
    let mut cursors: Vec<usize> = channels.iter().map(|c| c.position(start)).collect();
    let mut remaining = size as u128 * NANOS_PER_SEC;
    let mut now = start;
    while remaining > 0 {
        // Find the bottleneck and the next time any channel changes
        let mut rate = u64::MAX;
        let mut boundary: Option<SystemTime> = None;
        for (channel, cursor) in channels.iter().zip(&cursors) {
            let segment = channel.segments[*cursor];
            rate = rate.min(segment.available);
            if let Some(until) = segment.until {
                boundary = Some(boundary.map_or(until, |boundary| boundary.min(until)));
            }
        }

        // Progress until the message completes or availability changes
        let end = if rate == 0 {
            boundary.ok_or(Error::Starved)?
        } else {
            let needed = remaining.div_ceil(rate as u128);
            let finish = now + nanos(needed);
            let end = match boundary {
                Some(boundary) if boundary < finish => boundary,
                _ => finish,
            };
            let elapsed = end.duration_since(now).unwrap_or_default().as_nanos();
            remaining = remaining.saturating_sub(rate as u128 * elapsed);
            end
        };
        charge.push(Usage { rate, until: end });
        now = end;

        // Move past segments that have ended
        for (channel, cursor) in channels.iter().zip(cursors.iter_mut()) {
            while channel.segments[*cursor]
                .until
                .is_some_and(|until| until <= now)
            {
                *cursor += 1;
            }
        }
    }
    Ok(charge)
}

/// Subtract a charge from a channel, returning the updated channel.
///
/// Segments that ended before the charge started are dropped. Reserving more than is available
/// at any instant returns [Error::OverAllocation].
pub fn apply_charge(channel: &Channel, charge: &Charge) -> Result<Channel, Error> {
    channel.validate()?;
    let mut updated = Channel {
        segments: Vec::with_capacity(channel.segments.len() + charge.usages.len()),
    };
    let mut cursor = channel.position(charge.start);
    let mut now = charge.start;
    for usage in &charge.usages {
        while now < usage.until {
            let segment = channel.segments[cursor];
            let end = match segment.until {
                Some(until) if until < usage.until => until,
                _ => usage.until,
            };
            let available =
                segment
                    .available
                    .checked_sub(usage.rate)
                    .ok_or(Error::OverAllocation {
                        at: now.epoch(),
                        available: segment.available,
                        requested: usage.rate,
                    })?;
            updated.push(Segment {
                available,
                until: Some(end),
            });
            if segment.until == Some(end) {
                cursor += 1;
            }
            now = end;
        }
    }

    // The rest of the channel is untouched (the current segment continues from `now`)
    for segment in &channel.segments[cursor..] {
        updated.push(*segment);
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::UNIX_EPOCH;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn segment(available: u64, until: Option<u64>) -> Segment {
        Segment {
            available,
            until: until.map(at),
        }
    }

    /// Maximum tolerated difference between the requested and reserved volume (0.1 byte).
    const TOLERANCE: u128 = NANOS_PER_SEC / 10;

    fn assert_conserved(size: usize, charge: &Charge) {
        let expected = size as u128 * NANOS_PER_SEC;
        let transferred = charge.transferred();
        assert!(transferred >= expected, "{transferred} < {expected}");
        assert!(transferred - expected < TOLERANCE);
    }

    #[test]
    fn test_constant_channel() {
        let uplink = Channel::new(10);
        let downlink = Channel::new(100);
        let charge = compute_charge(50, &[&uplink, &downlink], at(0)).unwrap();
        assert_eq!(charge.usages(), &[Usage { rate: 10, until: at(5_000) }]);
        assert_eq!(charge.completion(), at(5_000));
        assert_conserved(50, &charge);
    }

    #[test]
    fn test_zero_size() {
        let channel = Channel::new(10);
        let charge = compute_charge(0, &[&channel], at(3)).unwrap();
        assert!(charge.usages().is_empty());
        assert_eq!(charge.completion(), at(3));
        assert_eq!(apply_charge(&channel, &charge).unwrap(), channel);
    }

    #[test]
    fn test_bottleneck_changes() {
        // Uplink drops after 1s, downlink rises after 2s
        let uplink =
            Channel::from_segments(vec![segment(100, Some(1_000)), segment(20, None)]).unwrap();
        let downlink =
            Channel::from_segments(vec![segment(50, Some(2_000)), segment(200, None)]).unwrap();
        let charge = compute_charge(130, &[&uplink, &downlink], at(0)).unwrap();

        // 50 bytes in the first second (downlink bound), 20 B/s afterwards
        assert_eq!(
            charge.usages(),
            &[
                Usage { rate: 50, until: at(1_000) },
                Usage { rate: 20, until: at(5_000) },
            ]
        );
        assert_conserved(130, &charge);
    }

    #[test]
    fn test_stall_until_available() {
        let uplink =
            Channel::from_segments(vec![segment(0, Some(2_000)), segment(10, None)]).unwrap();
        let downlink = Channel::new(10);
        let charge = compute_charge(10, &[&uplink, &downlink], at(500)).unwrap();
        assert_eq!(
            charge.usages(),
            &[
                Usage { rate: 0, until: at(2_000) },
                Usage { rate: 10, until: at(3_000) },
            ]
        );
        assert_conserved(10, &charge);
    }

    #[test]
    fn test_starved() {
        let uplink = Channel::new(0);
        let downlink = Channel::new(10);
        let result = compute_charge(1, &[&uplink, &downlink], at(0));
        assert!(matches!(result, Err(Error::Starved)));
    }

    #[test]
    fn test_malformed_channel() {
        // Final segment must be unbounded
        let result = Channel::from_segments(vec![segment(10, Some(1_000))]);
        assert!(matches!(result, Err(Error::MalformedChannel)));

        // Segments must be ordered
        let result = Channel::from_segments(vec![
            segment(10, Some(2_000)),
            segment(5, Some(1_000)),
            segment(1, None),
        ]);
        assert!(matches!(result, Err(Error::MalformedChannel)));

        // Channels must not be empty
        assert!(matches!(
            Channel::from_segments(Vec::new()),
            Err(Error::MalformedChannel)
        ));
    }

    #[test]
    fn test_partial_nanosecond_rounds_up() {
        // 1 byte at 3 B/s takes 333_333_333.3ns
        let channel = Channel::new(3);
        let charge = compute_charge(1, &[&channel], at(0)).unwrap();
        assert_eq!(charge.completion(), UNIX_EPOCH + Duration::from_nanos(333_333_334));
        assert_conserved(1, &charge);
    }

    #[test]
    fn test_apply_charge() {
        let channel = Channel::new(10);
        let charge = compute_charge(20, &[&channel], at(1_000)).unwrap();
        let updated = apply_charge(&channel, &charge).unwrap();
        assert_eq!(
            updated.segments(),
            &[segment(0, Some(3_000)), segment(10, None)]
        );

        // A second transfer must wait for the first to finish
        let second = compute_charge(10, &[&updated], at(1_000)).unwrap();
        assert_eq!(second.completion(), at(4_000));
        let updated = apply_charge(&updated, &second).unwrap();
        assert_eq!(updated.segments(), &[segment(0, Some(4_000)), segment(10, None)]);
    }

    #[test]
    fn test_apply_charge_prunes_past() {
        let channel =
            Channel::from_segments(vec![segment(5, Some(1_000)), segment(10, None)]).unwrap();
        let charge = compute_charge(10, &[&channel], at(2_000)).unwrap();
        let updated = apply_charge(&channel, &charge).unwrap();
        assert_eq!(updated.segments(), &[segment(0, Some(3_000)), segment(10, None)]);
    }

    #[test]
    fn test_over_allocation() {
        let channel = Channel::new(10);
        let wide = Channel::new(20);
        let charge = compute_charge(20, &[&wide], at(0)).unwrap();
        let result = apply_charge(&channel, &charge);
        assert!(matches!(
            result,
            Err(Error::OverAllocation {
                available: 10,
                requested: 20,
                ..
            })
        ));
    }

    #[test]
    fn test_prune() {
        let mut channel = Channel::from_segments(vec![
            segment(5, Some(1_000)),
            segment(7, Some(2_000)),
            segment(10, None),
        ])
        .unwrap();
        channel.prune(at(1_000));
        assert_eq!(channel.segments(), &[segment(7, Some(2_000)), segment(10, None)]);
        assert_eq!(channel.available_at(at(1_500)), 7);
        channel.prune(at(5_000));
        assert_eq!(channel.segments(), &[segment(10, None)]);
        assert_eq!(channel.available_at(at(1_500)), 10);
    }

    #[test]
    fn test_random_transfers_conserve_and_never_overdraw() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..50 {
            let capacity = rng.gen_range(1..10_000);
            let mut uplink = Channel::new(capacity);
            let mut downlinks: Vec<Channel> = (0..4)
                .map(|_| Channel::new(rng.gen_range(1..10_000)))
                .collect();
            let mut now = at(0);
            for _ in 0..20 {
                let size = rng.gen_range(0..100_000);
                let recipient = rng.gen_range(0..downlinks.len());
                let charge = compute_charge(size, &[&uplink, &downlinks[recipient]], now).unwrap();
                assert_conserved(size, &charge);

                // Applying never fails (and therefore never goes negative)
                uplink = apply_charge(&uplink, &charge).unwrap();
                downlinks[recipient] = apply_charge(&downlinks[recipient], &charge).unwrap();
                for segment in uplink.segments() {
                    assert!(segment.available <= capacity);
                }
                now += Duration::from_millis(rng.gen_range(0..2_000));
            }
        }
    }
}
