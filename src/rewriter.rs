//! Rewrites RTP sequence numbers and timestamps so one subscriber sees a
//! single continuous stream while the upstream source (simulcast layer,
//! hence SSRC) switches underneath it.
//!
//! The rewriter owns no reordering, duplicate detection or loss recovery;
//! it only maps identifiers. Every outgoing packet is stamped with the one
//! stable SSRC the subscription was assigned at creation.

use webrtc::rtp::packet::Packet;

const SEQ_BITS: u32 = 16;
const TS_BITS: u32 = 32;

/// Rollover-aware extension of a truncated `bits`-wide counter against the
/// latest extended value seen. The caller advances `latest` with the result.
fn expand(truncated: u64, latest: u64, bits: u32) -> u64 {
    let mask = (1u64 << bits) - 1;
    let boundary = 1u64 << (bits - 1);
    let x = truncated & mask;
    let tail = latest & mask;
    let mut rollovers = latest >> bits;
    if tail > x && tail - x > boundary {
        rollovers += 1;
    } else if rollovers > 0 && x > tail && x - tail > boundary {
        rollovers -= 1;
    }
    (rollovers << bits) | x
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Extended {
    ts: u64,
    seq: u64,
}

/// Forwarding state for the SSRC currently feeding the subscription.
#[derive(Debug)]
struct SourceState {
    ssrc: u32,
    /// First packet seen after the last switch, extended.
    first_incoming: Extended,
    /// Maximum incoming identifiers seen so far, extended.
    latest_incoming: Extended,
    /// Outgoing identifiers assigned to `first_incoming`.
    first_outgoing: Extended,
}

pub struct PacketRewriter {
    outgoing_ssrc: u32,
    started: bool,
    /// Maximum identifiers ever emitted.
    latest_outgoing: Extended,
    source: Option<SourceState>,
}

impl PacketRewriter {
    /// `outgoing_ssrc` is the SSRC assigned to the subscription's local
    /// track by the peer-connection stack; it never changes afterwards.
    pub fn new(outgoing_ssrc: u32) -> Self {
        Self {
            outgoing_ssrc,
            started: false,
            latest_outgoing: Extended::default(),
            source: None,
        }
    }

    /// Rewrites `packet` in place.
    ///
    /// A switch to a new SSRC re-bases the stream one timestamp unit and
    /// two sequence numbers past everything emitted so far, leaving a gap
    /// that makes the decoder treat the previous frame as incomplete. The
    /// very first packet of the subscription starts at zero instead.
    pub fn rewrite(&mut self, packet: &mut Packet) {
        let raw_seq = u64::from(packet.header.sequence_number);
        let raw_ts = u64::from(packet.header.timestamp);

        let outgoing = match self.source.as_mut() {
            Some(source) if source.ssrc == packet.header.ssrc => {
                let seq = expand(raw_seq, source.latest_incoming.seq, SEQ_BITS);
                source.latest_incoming.seq = source.latest_incoming.seq.max(seq);
                let ts = expand(raw_ts, source.latest_incoming.ts, TS_BITS);
                source.latest_incoming.ts = source.latest_incoming.ts.max(ts);
                Extended {
                    seq: source
                        .first_outgoing
                        .seq
                        .wrapping_add(seq.wrapping_sub(source.first_incoming.seq)),
                    ts: source
                        .first_outgoing
                        .ts
                        .wrapping_add(ts.wrapping_sub(source.first_incoming.ts)),
                }
            }
            _ => self.switch_source(packet.header.ssrc, raw_ts, raw_seq),
        };

        self.latest_outgoing.seq = self.latest_outgoing.seq.max(outgoing.seq);
        self.latest_outgoing.ts = self.latest_outgoing.ts.max(outgoing.ts);

        packet.header.sequence_number = outgoing.seq as u16;
        packet.header.timestamp = outgoing.ts as u32;
        packet.header.ssrc = self.outgoing_ssrc;
    }

    fn switch_source(&mut self, ssrc: u32, raw_ts: u64, raw_seq: u64) -> Extended {
        let first_outgoing = if self.started {
            Extended {
                ts: self.latest_outgoing.ts + 1,
                seq: self.latest_outgoing.seq + 2,
            }
        } else {
            self.started = true;
            self.latest_outgoing
        };
        let incoming = Extended {
            ts: raw_ts,
            seq: raw_seq,
        };
        self.source = Some(SourceState {
            ssrc,
            first_incoming: incoming,
            latest_incoming: incoming,
            first_outgoing,
        });
        first_outgoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, ts: u32, ssrc: u32) -> Packet {
        let mut p = Packet::default();
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.header.ssrc = ssrc;
        p
    }

    #[test]
    fn test_expand_rollover_forward() {
        let latest = 0xFFFFu64;
        let expanded = expand(0x0001, latest, 16);
        assert_eq!(expanded, 0x10001);
        assert_eq!(latest.max(expanded), 0x10001);
    }

    #[test]
    fn test_expand_late_packet_from_before_rollover() {
        let latest = 0x10001u64;
        let expanded = expand(0xFFFF, latest, 16);
        assert_eq!(expanded, 0xFFFF);
        // The maximum does not move backwards.
        assert_eq!(latest.max(expanded), 0x10001);
    }

    #[test]
    fn test_expand_no_rollover_within_window() {
        assert_eq!(expand(100, 50, 16), 100);
        assert_eq!(expand(50, 100, 16), 50);
    }

    #[test]
    fn test_first_packet_starts_at_zero() {
        let mut rw = PacketRewriter::new(9999);
        let mut p = packet(40000, 1_000_000, 1111);
        rw.rewrite(&mut p);
        assert_eq!(p.header.sequence_number, 0);
        assert_eq!(p.header.timestamp, 0);
        assert_eq!(p.header.ssrc, 9999);
    }

    #[test]
    fn test_stream_with_switch() {
        let mut rw = PacketRewriter::new(9999);
        let input = [
            (40000u16, 1_000_000u32, 1111u32),
            (50000, 1_200_000, 1111),
            (65000, 1_500_000, 1111),
            (10, 2_000_000, 1111), // sequence rolled over
            (10000, 20_000, 2222), // layer switch
        ];
        let expected = [
            (0u16, 0u32),
            (10000, 200_000),
            (25000, 500_000),
            (25546, 1_000_000),
            (25548, 1_000_001), // +2 seq / +1 ts gap past the previous maximum
        ];
        for ((seq, ts, ssrc), (want_seq, want_ts)) in input.into_iter().zip(expected) {
            let mut p = packet(seq, ts, ssrc);
            rw.rewrite(&mut p);
            assert_eq!(p.header.sequence_number, want_seq);
            assert_eq!(p.header.timestamp, want_ts);
            assert_eq!(p.header.ssrc, 9999);
        }
    }

    #[test]
    fn test_identity_on_deltas_without_switch() {
        // Within one SSRC the rewrite preserves deltas between consecutive
        // packets exactly.
        let mut rw = PacketRewriter::new(7);
        let seqs = [100u16, 101, 103, 104, 110];
        let tss = [3000u32, 6000, 9000, 12000, 18000];
        let mut out = Vec::new();
        for (&seq, &ts) in seqs.iter().zip(&tss) {
            let mut p = packet(seq, ts, 42);
            rw.rewrite(&mut p);
            out.push((p.header.sequence_number, p.header.timestamp));
        }
        for window in 0..out.len() - 1 {
            let (s0, t0) = out[window];
            let (s1, t1) = out[window + 1];
            assert_eq!(s1 - s0, seqs[window + 1] - seqs[window]);
            assert_eq!(t1 - t0, tss[window + 1] - tss[window]);
        }
    }

    #[test]
    fn test_random_in_order_stream_preserves_deltas() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut rw = PacketRewriter::new(5);
        let mut seq: u16 = rng.gen();
        let mut ts: u32 = rng.gen();
        let mut prev: Option<((u16, u32), (u16, u32))> = None;
        for _ in 0..1000 {
            seq = seq.wrapping_add(rng.gen_range(1..20));
            ts = ts.wrapping_add(rng.gen_range(0..5000));
            let mut p = packet(seq, ts, 99);
            rw.rewrite(&mut p);
            let out = (p.header.sequence_number, p.header.timestamp);
            if let Some((last_in, last_out)) = prev {
                assert_eq!(
                    out.0.wrapping_sub(last_out.0),
                    seq.wrapping_sub(last_in.0),
                    "sequence delta must survive the rewrite"
                );
                assert_eq!(
                    out.1.wrapping_sub(last_out.1),
                    ts.wrapping_sub(last_in.1),
                    "timestamp delta must survive the rewrite"
                );
            }
            prev = Some(((seq, ts), out));
        }
    }

    #[test]
    fn test_switch_back_and_forth_stays_monotonic() {
        let mut rw = PacketRewriter::new(1);
        let mut last = (0u64, 0u64);
        let feeds = [
            (100u16, 1000u32, 10u32),
            (101, 2000, 10),
            (7000, 500, 20),
            (7001, 1500, 20),
            (102, 3000, 10),
        ];
        for (i, (seq, ts, ssrc)) in feeds.into_iter().enumerate() {
            let mut p = packet(seq, ts, ssrc);
            rw.rewrite(&mut p);
            let now = (
                u64::from(p.header.sequence_number),
                u64::from(p.header.timestamp),
            );
            if i > 0 {
                assert!(now.0 >= last.0, "sequence went backwards at {i}");
                assert!(now.1 >= last.1, "timestamp went backwards at {i}");
            }
            last = now;
        }
    }
}
