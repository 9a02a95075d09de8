//! Traffic counters of a connection. Diagnostics only, never used for control flow.

/// Octet, frame and message counters.
///
/// Octets are counted at three levels: on the wire (frame headers included), at the
/// WebSocket level (frame payloads, compressed when compression is active) and at the
/// application level (message payloads as handed to or from the application).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct TrafficStats {
    pub outgoing_octets_wire_level: u64,
    pub outgoing_octets_websocket_level: u64,
    pub outgoing_octets_app_level: u64,
    pub outgoing_websocket_frames: u64,
    pub outgoing_websocket_messages: u64,

    pub incoming_octets_wire_level: u64,
    pub incoming_octets_websocket_level: u64,
    pub incoming_octets_app_level: u64,
    pub incoming_websocket_frames: u64,
    pub incoming_websocket_messages: u64,

    /// Octets written before the connection was open (opening handshake, proxy).
    pub preopen_outgoing_octets_wire_level: u64,
    /// Octets received before the connection was open.
    pub preopen_incoming_octets_wire_level: u64,
}

impl TrafficStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// WebSocket level over application level octets sent, when anything was sent.
    pub fn outgoing_compression_ratio(&self) -> Option<f64> {
        ratio(
            self.outgoing_octets_websocket_level,
            self.outgoing_octets_app_level,
        )
    }

    /// WebSocket level over application level octets received, when anything was received.
    pub fn incoming_compression_ratio(&self) -> Option<f64> {
        ratio(
            self.incoming_octets_websocket_level,
            self.incoming_octets_app_level,
        )
    }

    /// Share of outgoing wire octets spent on frame headers.
    pub fn outgoing_websocket_overhead(&self) -> Option<f64> {
        overhead(
            self.outgoing_octets_wire_level,
            self.outgoing_octets_websocket_level,
        )
    }

    /// Share of incoming wire octets spent on frame headers.
    pub fn incoming_websocket_overhead(&self) -> Option<f64> {
        overhead(
            self.incoming_octets_wire_level,
            self.incoming_octets_websocket_level,
        )
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

fn overhead(wire: u64, websocket: u64) -> Option<f64> {
    (websocket > 0).then(|| wire.saturating_sub(websocket) as f64 / websocket as f64)
}
