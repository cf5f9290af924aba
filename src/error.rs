use core::fmt;

/// Errors returned by the RLC stack.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Unexpectedly reached the end of a buffer while reading or writing data.
    ///
    /// This is returned when a PDU is truncated mid-field, and when the caller
    /// asks for a PDU to be built into a buffer that cannot even hold the
    /// header.
    Eof,

    /// Invalid value supplied for a field (eg. a zero length indicator).
    InvalidValue,

    /// A PDU specified lengths that do not add up to its actual size.
    InvalidLength,

    /// A data PDU carried an SN outside the receiving window.
    ///
    /// The PDU is dropped; if it carried a poll, a STATUS report is still
    /// triggered.
    OutOfWindow,

    /// A data PDU (or a byte range of one) was already received before.
    Duplicate,

    /// The peer sent a STATUS PDU that violates the protocol (ACK/NACK SNs
    /// out of range, descending NACK order, bad segment offsets).
    ///
    /// The STATUS PDU is rejected whole; no state is changed.
    Protocol,

    /// A fixed-capacity pool ran out of slots.
    Exhausted,

    /// A PDU reached `maxRetxThreshold` retransmissions and the registered
    /// callback asked for the transmission to be aborted.
    MaxRetx,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::Eof => "end of buffer",
            Error::InvalidValue => "invalid value for field",
            Error::InvalidLength => "length fields inconsistent with PDU size",
            Error::OutOfWindow => "SN outside the receiving window",
            Error::Duplicate => "duplicate PDU or byte segment",
            Error::Protocol => "protocol violation by peer",
            Error::Exhausted => "out of pool memory",
            Error::MaxRetx => "maximum retransmission count reached",
        })
    }
}
