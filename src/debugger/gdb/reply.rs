/// GDB remote reply packet under construction
pub struct Reply {
    packet: Vec<u8>,
    csum: u8,
}

impl Reply {
    pub fn new() -> Reply {
        Reply {
            packet: vec![b'$'],
            csum: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        for &b in data {
            self.csum = self.csum.wrapping_add(b);
            self.packet.push(b);
        }
    }

    pub fn push_u8(&mut self, v: u8) {
        self.push(&hex_pair(v));
    }

    /// Target byte order is little endian
    pub fn push_u16(&mut self, v: u16) {
        for b in v.to_le_bytes() {
            self.push_u8(b);
        }
    }

    pub fn push_u32(&mut self, v: u32) {
        for b in v.to_le_bytes() {
            self.push_u8(b);
        }
    }

    /// Terminate the packet with `#` and the checksum
    pub fn into_packet(mut self) -> Vec<u8> {
        let csum = hex_pair(self.csum);
        self.packet.push(b'#');
        self.packet.extend_from_slice(&csum);
        self.packet
    }
}

fn hex_pair(v: u8) -> [u8; 2] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    [HEX[(v >> 4) as usize], HEX[(v & 0xf) as usize]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_packet() {
        let mut reply = Reply::new();
        reply.push(b"OK");
        assert_eq!(reply.into_packet(), b"$OK#9a".to_vec());
    }

    #[test]
    fn test_words_are_little_endian() {
        let mut reply = Reply::new();
        reply.push_u32(0x1234_5678);
        let packet = reply.into_packet();
        assert_eq!(&packet[1..9], b"78563412");
    }
}
