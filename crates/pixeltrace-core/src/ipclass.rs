use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address class of a client IP, evaluated against the reserved ranges in a
/// fixed order (first match wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    Invalid,
    Unspecified,
    Loopback,
    LinkLocal,
    Private,
    Cgnat,
    Documentation,
    Benchmark,
    Multicast,
    Broadcast,
    Reserved,
    Public,
}

impl IpClass {
    /// Stable lowercase label used in the IP dimension and `_srv_` output.
    pub fn label(self) -> &'static str {
        match self {
            IpClass::Invalid => "invalid",
            IpClass::Unspecified => "unspecified",
            IpClass::Loopback => "loopback",
            IpClass::LinkLocal => "linklocal",
            IpClass::Private => "private",
            IpClass::Cgnat => "cgnat",
            IpClass::Documentation => "documentation",
            IpClass::Benchmark => "benchmark",
            IpClass::Multicast => "multicast",
            IpClass::Broadcast => "broadcast",
            IpClass::Reserved => "reserved",
            IpClass::Public => "public",
        }
    }
}

/// Classification result: the class plus whether a geolocation lookup makes
/// sense for this address. Only CGNAT and public addresses geolocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: IpClass,
    pub should_geolocate: bool,
}

/// Classify a printable IP address.
///
/// Total function: every input produces a class, `Invalid` iff the string
/// does not parse. IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are
/// re-projected into the v4 space before range evaluation, so
/// `::ffff:192.168.1.1` classifies as `Private`.
pub fn classify(ip: &str) -> Classification {
    let Ok(addr) = ip.trim().parse::<IpAddr>() else {
        return Classification {
            class: IpClass::Invalid,
            should_geolocate: false,
        };
    };

    let class = match addr {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4),
            None => classify_v6(v6),
        },
    };

    Classification {
        class,
        should_geolocate: matches!(class, IpClass::Cgnat | IpClass::Public),
    }
}

fn classify_v4(ip: Ipv4Addr) -> IpClass {
    let [a, b, _, _] = ip.octets();
    if ip.is_unspecified() {
        IpClass::Unspecified
    } else if a == 127 {
        IpClass::Loopback
    } else if a == 169 && b == 254 {
        IpClass::LinkLocal
    } else if a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168) {
        IpClass::Private
    } else if a == 100 && (64..=127).contains(&b) {
        IpClass::Cgnat
    } else if in_v4(ip, [192, 0, 2, 0], 24)
        || in_v4(ip, [198, 51, 100, 0], 24)
        || in_v4(ip, [203, 0, 113, 0], 24)
    {
        IpClass::Documentation
    } else if a == 198 && (b == 18 || b == 19) {
        IpClass::Benchmark
    } else if (224..=239).contains(&a) {
        IpClass::Multicast
    } else if ip == Ipv4Addr::BROADCAST {
        IpClass::Broadcast
    } else if a >= 240 {
        IpClass::Reserved
    } else {
        IpClass::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> IpClass {
    let seg = ip.segments();
    if ip.is_unspecified() {
        IpClass::Unspecified
    } else if ip.is_loopback() {
        IpClass::Loopback
    } else if (seg[0] & 0xffc0) == 0xfe80 {
        IpClass::LinkLocal
    } else if (seg[0] & 0xfe00) == 0xfc00 {
        IpClass::Private
    } else if seg[0] == 0x2001 && seg[1] == 0x0db8 {
        IpClass::Documentation
    } else if (seg[0] & 0xff00) == 0xff00 {
        IpClass::Multicast
    } else {
        IpClass::Public
    }
}

fn in_v4(ip: Ipv4Addr, net: [u8; 4], prefix: u32) -> bool {
    let ip = u32::from(ip);
    let net = u32::from(Ipv4Addr::from(net));
    let mask = u32::MAX << (32 - prefix);
    (ip & mask) == (net & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_of(ip: &str) -> IpClass {
        classify(ip).class
    }

    #[test]
    fn invalid_inputs_never_panic() {
        for raw in ["", "not-an-ip", "999.1.1.1", "1.2.3", "::gg", "  "] {
            let c = classify(raw);
            assert_eq!(c.class, IpClass::Invalid);
            assert!(!c.should_geolocate);
        }
    }

    #[test]
    fn cgnat_geolocates() {
        let c = classify("100.64.0.1");
        assert_eq!(c.class, IpClass::Cgnat);
        assert!(c.should_geolocate);
        assert_eq!(class_of("100.127.255.255"), IpClass::Cgnat);
        // 100.128.0.0 is outside 100.64/10.
        assert_eq!(class_of("100.128.0.1"), IpClass::Public);
    }

    #[test]
    fn v4_mapped_v6_reprojects() {
        let c = classify("::ffff:192.168.1.1");
        assert_eq!(c.class, IpClass::Private);
        assert!(!c.should_geolocate);
        assert_eq!(class_of("::ffff:8.8.8.8"), IpClass::Public);
    }

    #[test]
    fn loopback_does_not_geolocate() {
        let c = classify("127.0.0.1");
        assert_eq!(c.class, IpClass::Loopback);
        assert!(!c.should_geolocate);
        assert_eq!(class_of("::1"), IpClass::Loopback);
        assert_eq!(class_of("127.255.0.1"), IpClass::Loopback);
    }

    #[test]
    fn private_ranges() {
        for ip in ["10.0.0.1", "172.16.0.1", "172.31.255.254", "192.168.0.1", "fc00::1", "fdab::2"] {
            assert_eq!(class_of(ip), IpClass::Private, "{ip}");
        }
        // 172.32/12 is outside the private block.
        assert_eq!(class_of("172.32.0.1"), IpClass::Public);
    }

    #[test]
    fn documentation_benchmark_multicast() {
        assert_eq!(class_of("192.0.2.55"), IpClass::Documentation);
        assert_eq!(class_of("198.51.100.1"), IpClass::Documentation);
        assert_eq!(class_of("203.0.113.200"), IpClass::Documentation);
        assert_eq!(class_of("2001:db8::1"), IpClass::Documentation);
        assert_eq!(class_of("198.18.0.1"), IpClass::Benchmark);
        assert_eq!(class_of("198.19.255.255"), IpClass::Benchmark);
        assert_eq!(class_of("224.0.0.1"), IpClass::Multicast);
        assert_eq!(class_of("239.255.255.255"), IpClass::Multicast);
        assert_eq!(class_of("ff02::1"), IpClass::Multicast);
    }

    #[test]
    fn broadcast_wins_over_reserved() {
        assert_eq!(class_of("255.255.255.255"), IpClass::Broadcast);
        assert_eq!(class_of("255.0.0.1"), IpClass::Reserved);
        assert_eq!(class_of("240.0.0.1"), IpClass::Reserved);
    }

    #[test]
    fn unspecified() {
        assert_eq!(class_of("0.0.0.0"), IpClass::Unspecified);
        assert_eq!(class_of("::"), IpClass::Unspecified);
    }

    #[test]
    fn link_local() {
        assert_eq!(class_of("169.254.10.20"), IpClass::LinkLocal);
        assert_eq!(class_of("fe80::1"), IpClass::LinkLocal);
        assert_eq!(class_of("febf::1"), IpClass::LinkLocal);
        assert_eq!(class_of("fec0::1"), IpClass::Public);
    }

    #[test]
    fn public_geolocates() {
        let c = classify("8.8.8.8");
        assert_eq!(c.class, IpClass::Public);
        assert!(c.should_geolocate);
        assert!(classify("2606:4700::1111").should_geolocate);
    }
}
