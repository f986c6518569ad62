//! Lenient TCP connection state machine and receive-window check.
//!
//! The machine only judges whether a segment fits the connection's
//! lifecycle. The engine decides what a rejection means: strict mode drops
//! the segment, the default mode logs it and keeps the data.

use crate::flow::Direction;
use crate::protocol::tcp::TcpHeader;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake in progress (SYN and/or SYN-ACK seen).
    Pending,
    Established,
    /// At least one side sent FIN.
    Closing,
    /// Both sides closed or the connection was reset.
    Complete,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Pending => write!(f, "pending"),
            ConnState::Established => write!(f, "established"),
            ConnState::Closing => write!(f, "closing"),
            ConnState::Complete => write!(f, "complete"),
        }
    }
}

/// The subset of a TCP header the state machine looks at.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub seq: u32,
    pub ack: Option<u32>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub window: u16,
    pub window_scale: Option<u8>,
    pub payload_len: usize,
}

impl Segment {
    pub fn from_header(tcp: &TcpHeader<'_>) -> Self {
        Segment {
            seq: tcp.sequence_number(),
            ack: tcp.ack().then(|| tcp.ack_number()),
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            window: tcp.window_size(),
            window_scale: if tcp.syn() { tcp.window_scale() } else { None },
            payload_len: tcp.payload().len(),
        }
    }
}

/// Reason a segment did not fit the expected lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    MissingHandshake,
    SynOnOpenConnection,
    AfterClose,
    OutsideWindow,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingHandshake => write!(f, "segment before handshake"),
            Violation::SynOnOpenConnection => write!(f, "SYN on open connection"),
            Violation::AfterClose => write!(f, "segment after close"),
            Violation::OutsideWindow => write!(f, "segment outside receive window"),
        }
    }
}

#[derive(Debug)]
pub struct TcpFsm {
    state: ConnState,
    allow_missing_init: bool,
    syn_seen: bool,
    fin_seen: [bool; 2],
}

fn side(dir: Direction) -> usize {
    match dir {
        Direction::Client => 0,
        Direction::Server => 1,
    }
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        TcpFsm {
            state: ConnState::Pending,
            allow_missing_init,
            syn_seen: false,
            fin_seen: [false; 2],
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Advance on `seg` sent by `dir`. FIN and RST are honoured even when a
    /// violation is reported so that lenient callers stay in step with the
    /// traffic.
    pub fn advance(&mut self, seg: &Segment, dir: Direction) -> Result<(), Violation> {
        if self.state == ConnState::Complete {
            return Err(Violation::AfterClose);
        }
        if seg.rst {
            self.state = ConnState::Complete;
            return Ok(());
        }

        let mut verdict = Ok(());
        match self.state {
            ConnState::Pending => {
                if seg.syn {
                    self.syn_seen = true;
                } else if self.syn_seen || self.allow_missing_init {
                    self.state = ConnState::Established;
                } else {
                    verdict = Err(Violation::MissingHandshake);
                }
            }
            ConnState::Established | ConnState::Closing => {
                if seg.syn {
                    verdict = Err(Violation::SynOnOpenConnection);
                }
            }
            ConnState::Complete => {}
        }

        if seg.fin {
            self.fin_seen[side(dir)] = true;
            self.state = if self.fin_seen.iter().all(|f| *f) {
                ConnState::Complete
            } else {
                ConnState::Closing
            };
        }
        verdict
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WindowState {
    scale: u8,
    /// Last acknowledgement sent by this side.
    ack: Option<u32>,
    /// Last advertised window, scaled.
    window: u32,
}

/// Light receive-window check applied in strict mode: a data segment must
/// start within the window the receiver last advertised.
#[derive(Debug, Default)]
pub struct WindowCheck {
    sides: [WindowState; 2],
}

impl WindowCheck {
    pub fn accept(&mut self, seg: &Segment, dir: Direction) -> Result<(), Violation> {
        let me = side(dir);
        if let Some(scale) = seg.window_scale {
            self.sides[me].scale = scale;
        }

        let peer = self.sides[1 - me];
        let verdict = match peer.ack {
            Some(peer_ack) if seg.payload_len > 0 && !seg.syn => {
                let ahead = seg.seq.wrapping_sub(peer_ack) as i32;
                if ahead > 0 && ahead as u32 > peer.window {
                    Err(Violation::OutsideWindow)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        };

        if let Some(ack) = seg.ack {
            let state = &mut self.sides[me];
            state.ack = Some(ack);
            state.window = (seg.window as u32) << state.scale;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(flags: &str, seq: u32, ack: Option<u32>, len: usize) -> Segment {
        Segment {
            seq,
            ack,
            syn: flags.contains('S'),
            fin: flags.contains('F'),
            rst: flags.contains('R'),
            window: 1000,
            window_scale: None,
            payload_len: len,
        }
    }

    #[test]
    fn full_lifecycle() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.advance(&seg("S", 0, None, 0), Direction::Client).is_ok());
        assert!(fsm.advance(&seg("S", 0, Some(1), 0), Direction::Server).is_ok());
        assert_eq!(fsm.state(), ConnState::Pending);
        assert!(fsm.advance(&seg("", 1, Some(1), 0), Direction::Client).is_ok());
        assert_eq!(fsm.state(), ConnState::Established);
        assert!(fsm.advance(&seg("F", 1, Some(1), 0), Direction::Client).is_ok());
        assert_eq!(fsm.state(), ConnState::Closing);
        assert!(fsm.advance(&seg("F", 1, Some(2), 0), Direction::Server).is_ok());
        assert_eq!(fsm.state(), ConnState::Complete);
        assert_eq!(
            fsm.advance(&seg("", 2, Some(2), 0), Direction::Client),
            Err(Violation::AfterClose)
        );
    }

    #[test]
    fn lenient_mode_accepts_midstream_start() {
        let mut fsm = TcpFsm::new(true);
        assert!(fsm.advance(&seg("", 500, None, 10), Direction::Server).is_ok());
        assert_eq!(fsm.state(), ConnState::Established);
    }

    #[test]
    fn strict_init_reports_missing_handshake() {
        let mut fsm = TcpFsm::new(false);
        assert_eq!(
            fsm.advance(&seg("", 500, None, 10), Direction::Client),
            Err(Violation::MissingHandshake)
        );
        assert_eq!(fsm.state(), ConnState::Pending);
        // A later handshake recovers the connection.
        assert!(fsm.advance(&seg("S", 0, None, 0), Direction::Client).is_ok());
        assert!(fsm.advance(&seg("", 1, Some(1), 0), Direction::Client).is_ok());
        assert_eq!(fsm.state(), ConnState::Established);
    }

    #[test]
    fn reset_completes() {
        let mut fsm = TcpFsm::new(true);
        fsm.advance(&seg("", 1, Some(1), 3), Direction::Client).unwrap();
        fsm.advance(&seg("R", 1, None, 0), Direction::Server).unwrap();
        assert_eq!(fsm.state(), ConnState::Complete);
    }

    #[test]
    fn syn_on_open_connection_is_flagged() {
        let mut fsm = TcpFsm::new(true);
        fsm.advance(&seg("", 1, Some(1), 3), Direction::Client).unwrap();
        assert_eq!(
            fsm.advance(&seg("S", 0, None, 0), Direction::Client),
            Err(Violation::SynOnOpenConnection)
        );
    }

    #[test]
    fn window_check_rejects_far_segment() {
        let mut check = WindowCheck::default();
        // Server acknowledges up to 100 with a window of 1000.
        check.accept(&seg("", 0, Some(100), 0), Direction::Server).unwrap();
        assert!(check.accept(&seg("", 150, Some(1), 10), Direction::Client).is_ok());
        assert_eq!(
            check.accept(&seg("", 5_000, Some(1), 10), Direction::Client),
            Err(Violation::OutsideWindow)
        );
        // Retransmissions below the ack are fine.
        assert!(check.accept(&seg("", 50, Some(1), 10), Direction::Client).is_ok());
    }
}
