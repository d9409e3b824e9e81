//! Output sink contract.

use sipdiag_dissect::Packet;

/// Where storage fans interesting packets out to.
///
/// Implementations write pcap files, text dumps or HEP envelopes; the
/// contract is just write-then-close.
pub trait PacketSink: Send {
    /// Writes one packet.
    ///
    /// `link_type` is the datalink of the input the packet arrived on,
    /// when it arrived over a pcap source.
    fn write(&mut self, packet: &Packet, link_type: Option<i32>);

    /// Flushes and releases the sink.
    fn close(&mut self);
}
