use std::net::SocketAddrV4;

use siphasher::sip::SipHasher13;

/// Keyed tag attached to tunnel and relay requests. Both ends derive the key from the deployment
/// identity string, so requests from a different deployment (or stray traffic) are filtered out.
pub struct RequestMacHasher {
    key: [u8; 16],
}

impl RequestMacHasher {
    pub fn new(im: &str) -> Self {
        use core::hash::Hasher;

        let mut key = [0; 16];

        for (i, half) in key.chunks_exact_mut(8).enumerate() {
            let mut hasher = SipHasher13::new_with_keys(0x7061_636b_7475_6e00, i as u64);
            hasher.write(im.as_bytes());
            half.copy_from_slice(&hasher.finish().to_be_bytes());
        }

        Self { key }
    }

    fn write_addr(hasher: &mut SipHasher13, addr: &SocketAddrV4) {
        use core::hash::Hasher;

        hasher.write(&addr.ip().octets());
        hasher.write_u16(addr.port());
    }

    pub fn compute_tunnel(&self, dst: &SocketAddrV4) -> u64 {
        use core::hash::Hasher;

        let mut hasher = SipHasher13::new_with_key(&self.key);

        hasher.write_u8(1);
        Self::write_addr(&mut hasher, dst);

        hasher.finish()
    }

    pub fn compute_relay(&self, src: &SocketAddrV4, dst: &SocketAddrV4) -> u64 {
        use core::hash::Hasher;

        let mut hasher = SipHasher13::new_with_key(&self.key);

        hasher.write_u8(13);
        Self::write_addr(&mut hasher, src);
        Self::write_addr(&mut hasher, dst);

        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    #[test]
    fn keyed_by_identity() {
        let dst = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 5353);

        let a = RequestMacHasher::new("alpha");
        let b = RequestMacHasher::new("beta");

        assert_eq!(a.compute_tunnel(&dst), RequestMacHasher::new("alpha").compute_tunnel(&dst));
        assert_ne!(a.compute_tunnel(&dst), b.compute_tunnel(&dst));
        assert_ne!(a.compute_relay(&src, &dst), a.compute_relay(&dst, &src));
    }
}
