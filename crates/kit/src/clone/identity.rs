//! Fresh hardware identity for cloned devices.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use tracing::debug;

use super::error::InvariantViolation;
use super::model::{GraphicsDevice, NetworkInterface, PortAllocation};

/// Upper bound on random suffixes tried per interface
pub const MAX_MAC_ATTEMPTS: usize = 100;

/// A 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// The organizationally unique identifier (first three octets)
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    /// Keep the OUI and replace the device-specific half
    pub fn with_suffix(&self, suffix: [u8; 3]) -> Self {
        let o = self.0;
        Self([o[0], o[1], o[2], suffix[0], suffix[1], suffix[2]])
    }
}

impl FromStr for MacAddr {
    type Err = InvariantViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvariantViolation::InvalidMac(s.to_owned());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

fn format_oui(oui: [u8; 3]) -> String {
    format!("{:02x}:{:02x}:{:02x}", oui[0], oui[1], oui[2])
}

/// Hands out MAC addresses that collide with nothing seen so far.
///
/// Every address it returns is added to the taken set, so interfaces of the
/// same clone never share an address either.
#[derive(Debug)]
pub struct IdentityRegenerator<R> {
    rng: R,
    taken: HashSet<MacAddr>,
}

impl<R: RngCore> IdentityRegenerator<R> {
    /// Start from the set of addresses already in use on the host
    pub fn new(rng: R, taken: impl IntoIterator<Item = MacAddr>) -> Self {
        Self {
            rng,
            taken: taken.into_iter().collect(),
        }
    }

    /// Pick a new address with the same OUI as `original`
    pub fn regenerate_mac(&mut self, original: &str) -> Result<MacAddr, InvariantViolation> {
        let original: MacAddr = original.to_ascii_lowercase().parse()?;
        self.taken.insert(original);
        for attempt in 1..=MAX_MAC_ATTEMPTS {
            let mut suffix = [0u8; 3];
            self.rng.fill_bytes(&mut suffix);
            let candidate = original.with_suffix(suffix);
            if self.taken.insert(candidate) {
                debug!("Replacing MAC {original} with {candidate} (attempt {attempt})");
                return Ok(candidate);
            }
        }
        Err(InvariantViolation::MacSpaceExhausted {
            oui: format_oui(original.oui()),
            attempts: MAX_MAC_ATTEMPTS,
        })
    }

    /// Copy of `iface` with a fresh MAC and no host-side device name
    pub fn regenerate_interface(
        &mut self,
        iface: &NetworkInterface,
    ) -> Result<NetworkInterface, InvariantViolation> {
        let mac = match iface.mac.as_deref() {
            Some(mac) => Some(self.regenerate_mac(mac)?.to_string()),
            None => None,
        };
        Ok(NetworkInterface {
            kind: iface.kind.clone(),
            mac,
            target: None,
        })
    }
}

/// Copy of `device` that lets the hypervisor choose its ports
pub fn auto_allocate_graphics(device: &GraphicsDevice) -> GraphicsDevice {
    if !GraphicsDevice::uses_ports(&device.kind) {
        return device.clone();
    }
    GraphicsDevice {
        kind: device.kind.clone(),
        ports: Some(PortAllocation::Auto),
        websocket: device.websocket.map(|_| -1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Always produces the same bytes
    struct ConstRng(u8);

    impl RngCore for ConstRng {
        fn next_u32(&mut self) -> u32 {
            u32::from_ne_bytes([self.0; 4])
        }
        fn next_u64(&mut self) -> u64 {
            u64::from_ne_bytes([self.0; 8])
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0)
        }
    }

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddr = "52:54:00:AB:cd:0f".parse().unwrap();
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:0f");
        assert_eq!(mac.oui(), [0x52, 0x54, 0x00]);
        for bad in [
            "",
            "52:54:00:ab:cd",
            "52:54:00:ab:cd:0f:11",
            "52-54-00-ab-cd-0f",
            "52:54:00:ab:cd:g0",
            "5:54:00:ab:cd:0f0",
        ] {
            assert_eq!(
                bad.parse::<MacAddr>(),
                Err(InvariantViolation::InvalidMac(bad.to_owned())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_regenerated_macs_keep_oui_and_are_unique() {
        let host: Vec<MacAddr> = vec!["52:54:00:11:22:33".parse().unwrap()];
        let mut regen = IdentityRegenerator::new(StdRng::seed_from_u64(7), host.clone());
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let mac = regen.regenerate_mac("52:54:00:11:22:33").unwrap();
            assert_eq!(mac.oui(), [0x52, 0x54, 0x00]);
            assert!(!host.contains(&mac));
            assert!(seen.insert(mac), "duplicate {mac}");
        }
    }

    #[test]
    fn test_collision_rerolls() {
        // The constant generator always proposes ..:07:07:07, which is taken
        let taken = ["52:54:00:07:07:07".parse().unwrap()];
        let mut regen = IdentityRegenerator::new(ConstRng(7), taken);
        assert_eq!(
            regen.regenerate_mac("52:54:00:00:00:01"),
            Err(InvariantViolation::MacSpaceExhausted {
                oui: "52:54:00".into(),
                attempts: MAX_MAC_ATTEMPTS,
            })
        );

        let mut regen = IdentityRegenerator::new(ConstRng(9), []);
        let first = regen.regenerate_mac("52:54:00:00:00:01").unwrap();
        assert_eq!(first.to_string(), "52:54:00:09:09:09");
        // Same proposal again now collides with the address just handed out
        assert!(regen.regenerate_mac("52:54:00:00:00:02").is_err());
    }

    #[test]
    fn test_original_is_never_reused() {
        let mut regen = IdentityRegenerator::new(ConstRng(0x22), []);
        assert!(regen.regenerate_mac("52:54:00:22:22:22").is_err());
    }

    #[test]
    fn test_regenerate_interface_clears_target() {
        let iface = NetworkInterface {
            kind: "network".into(),
            mac: Some("52:54:00:aa:bb:cc".into()),
            target: Some("vnet3".into()),
        };
        let mut regen = IdentityRegenerator::new(StdRng::seed_from_u64(1), []);
        let out = regen.regenerate_interface(&iface).unwrap();
        assert_eq!(out.kind, "network");
        assert_eq!(out.target, None);
        let mac = out.mac.unwrap();
        assert!(mac.starts_with("52:54:00:"));
        assert_ne!(mac, "52:54:00:aa:bb:cc");

        let bad = NetworkInterface {
            mac: Some("not-a-mac".into()),
            ..iface
        };
        assert!(matches!(
            regen.regenerate_interface(&bad),
            Err(InvariantViolation::InvalidMac(_))
        ));
    }

    #[test]
    fn test_auto_allocate_graphics() {
        let vnc = GraphicsDevice {
            kind: "vnc".into(),
            ports: Some(PortAllocation::Fixed {
                port: Some(5901),
                tls_port: None,
            }),
            websocket: Some(5701),
        };
        let out = auto_allocate_graphics(&vnc);
        assert_eq!(out.ports, Some(PortAllocation::Auto));
        assert_eq!(out.websocket, Some(-1));

        let sdl = GraphicsDevice {
            kind: "sdl".into(),
            ports: None,
            websocket: None,
        };
        assert_eq!(auto_allocate_graphics(&sdl), sdl);
    }
}
