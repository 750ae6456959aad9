//! Filter operand decoding.
//!
//! A compiled profile stores each filter argument as a 16-bit value whose
//! meaning depends on the filter's `data_type`. Small types (booleans, modes,
//! owners, ioctls) are encoded inline; the others are offsets into the
//! profile's string, pattern or network pools, reached via [`OperandPool`].

use std::fmt;

use super::types::FilterInfo;
use crate::error::{Error, Result};

/// `#t` / `#f`
pub const ARG_BOOLEAN: u8 = 1;
/// File mode bits
pub const ARG_OCTAL: u8 = 2;
/// Owner id, named through the filter's aliases
pub const ARG_OWNER: u8 = 3;
/// ioctl request
pub const ARG_CTRL: u8 = 4;
/// Offset into the string pool
pub const ARG_STRING_OFFSET: u8 = 5;
/// Offset into the pattern pool
pub const ARG_RSS_OFFSET: u8 = 6;
/// Offset into the pattern pool, second flavour
pub const ARG_RSS_OFFSET_ALT: u8 = 7;
/// Offset into the pattern pool, rendered as a path literal
pub const ARG_RSS_OFFSET_WITH_TYPE: u8 = 8;
/// Offset into the network address pool
pub const ARG_NETWORK_OFFSET: u8 = 9;

/// Host values above this denote loopback.
const LOCALHOST_FLAG: u16 = 0x100;

/// Lookups into the pools of a compiled profile.
pub trait OperandPool {
    /// Returns the string at `offset` in the string pool.
    fn string_at(&self, offset: u32) -> Result<String>;

    /// Returns the pattern segments at `offset` in the pattern pool.
    fn pattern_at(&self, offset: u32) -> Result<Vec<String>>;

    /// Returns the `(host, port)` pair at `offset` in the network pool.
    fn host_port_at(&self, offset: u32) -> Result<(u16, u16)>;
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Source text used as is
    Text(String),
    /// A path literal
    Literal(String),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Text(text) => f.write_str(text),
            Operand::Literal(path) => write!(f, "(literal \"{path}\")"),
        }
    }
}

/// Decodes a raw operand of `filter` into profile source text.
pub fn decode_operand<P>(filter: &FilterInfo, raw: u16, pool: &P) -> Result<Operand>
where
    P: OperandPool + ?Sized,
{
    let text = match filter.data_type {
        ARG_BOOLEAN => (if raw == 1 { "#t" } else { "#f" }).to_string(),
        ARG_OCTAL => format!("#o{raw:04o}"),
        ARG_OWNER => filter.alias(raw)?.name.clone(),
        ARG_CTRL => match filter.alias(raw) {
            Ok(alias) => alias.name.clone(),
            Err(_) => format!("_IO \"{}\" {}", char::from((raw >> 8) as u8), raw & 0xff),
        },
        ARG_STRING_OFFSET => format!("\"{}\"", pool.string_at(u32::from(raw))?),
        ARG_RSS_OFFSET | ARG_RSS_OFFSET_ALT => pool.pattern_at(u32::from(raw))?.join(" "),
        ARG_RSS_OFFSET_WITH_TYPE => {
            return Ok(Operand::Literal(pool.pattern_at(u32::from(raw))?.join(" ")));
        }
        ARG_NETWORK_OFFSET => {
            let (mut host, port) = pool.host_port_at(u32::from(raw))?;
            let host_text = if host > LOCALHOST_FLAG {
                host &= 0xff;
                "localhost"
            } else {
                "*"
            };
            let alias = filter.alias(host)?;
            let port_text = if port == 0 {
                "*".to_string()
            } else {
                port.to_string()
            };
            format!("{} \"{}:{}\"", alias.name, host_text, port_text)
        }
        _ => {
            return Err(Error::UnsupportedOperandCategory {
                category: filter.category.clone(),
            })
        }
    };

    Ok(Operand::Text(text))
}

/// A pool for profiles without string, pattern or network sections.
///
/// Every lookup fails, so only inline operand types can be decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPool;

impl OperandPool for NoPool {
    fn string_at(&self, offset: u32) -> Result<String> {
        Err(Error::OperandOutOfRange { offset })
    }

    fn pattern_at(&self, offset: u32) -> Result<Vec<String>> {
        Err(Error::OperandOutOfRange { offset })
    }

    fn host_port_at(&self, offset: u32) -> Result<(u16, u16)> {
        Err(Error::OperandOutOfRange { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::MemoryPool;
    use crate::sandbox::Alias;

    fn filter(data_type: u8, aliases: &[(&str, u16)]) -> FilterInfo {
        FilterInfo {
            name: "test".into(),
            category: "test-category".into(),
            data_type,
            aliases: aliases
                .iter()
                .map(|(name, id)| Alias {
                    name: name.to_string(),
                    id: *id,
                    unknown: 0,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn text(f: &FilterInfo, raw: u16, pool: &MemoryPool) -> String {
        decode_operand(f, raw, pool).unwrap().to_string()
    }

    #[test]
    fn test_boolean() {
        let f = filter(ARG_BOOLEAN, &[]);
        let pool = MemoryPool::default();
        assert_eq!(text(&f, 1, &pool), "#t");
        assert_eq!(text(&f, 0, &pool), "#f");
        assert_eq!(text(&f, 2, &pool), "#f");
    }

    #[test]
    fn test_octal() {
        let f = filter(ARG_OCTAL, &[]);
        let pool = MemoryPool::default();
        assert_eq!(text(&f, 0o755, &pool), "#o0755");
        assert_eq!(text(&f, 0o4000, &pool), "#o4000");
        assert_eq!(text(&f, 8, &pool), "#o0010");
    }

    #[test]
    fn test_owner() {
        let f = filter(ARG_OWNER, &[("root", 0), ("wheel", 1)]);
        let pool = MemoryPool::default();
        assert_eq!(text(&f, 1, &pool), "wheel");
        assert!(matches!(
            decode_operand(&f, 5, &pool),
            Err(Error::UnknownAlias { id: 5 })
        ));
    }

    #[test]
    fn test_ioctl_falls_back_to_io_form() {
        let f = filter(ARG_CTRL, &[("TIOCSCTTY", 0x7461)]);
        let pool = MemoryPool::default();
        assert_eq!(text(&f, 0x7461, &pool), "TIOCSCTTY");
        assert_eq!(text(&f, 0x7403, &pool), "_IO \"t\" 3");
    }

    #[test]
    fn test_pool_operands() {
        let mut pool = MemoryPool::default();
        pool.strings.insert(4, "com.apple.cfprefsd".into());
        pool.patterns
            .insert(9, vec!["/private/var".into(), "/tmp".into()]);

        let s = filter(ARG_STRING_OFFSET, &[]);
        assert_eq!(text(&s, 4, &pool), "\"com.apple.cfprefsd\"");

        for tag in [ARG_RSS_OFFSET, ARG_RSS_OFFSET_ALT] {
            let p = filter(tag, &[]);
            assert_eq!(text(&p, 9, &pool), "/private/var /tmp");
        }

        let lit = filter(ARG_RSS_OFFSET_WITH_TYPE, &[]);
        let operand = decode_operand(&lit, 9, &pool).unwrap();
        assert_eq!(operand, Operand::Literal("/private/var /tmp".into()));
        assert_eq!(operand.to_string(), "(literal \"/private/var /tmp\")");

        assert!(matches!(
            decode_operand(&s, 5, &pool),
            Err(Error::OperandOutOfRange { offset: 5 })
        ));
    }

    #[test]
    fn test_network_localhost() {
        let f = filter(ARG_NETWORK_OFFSET, &[("*", 0), ("ip", 1)]);
        let mut pool = MemoryPool::default();
        pool.host_ports.insert(0, (0x0101, 80));
        pool.host_ports.insert(1, (0x0001, 0));

        assert_eq!(text(&f, 0, &pool), "ip \"localhost:80\"");
        assert_eq!(text(&f, 1, &pool), "ip \"*:*\"");
    }

    #[test]
    fn test_network_unknown_host_alias() {
        let f = filter(ARG_NETWORK_OFFSET, &[("ip", 1)]);
        let mut pool = MemoryPool::default();
        pool.host_ports.insert(0, (0x0105, 22));

        assert!(matches!(
            decode_operand(&f, 0, &pool),
            Err(Error::UnknownAlias { id: 5 })
        ));
    }

    #[test]
    fn test_unsupported_type() {
        let f = filter(12, &[]);
        let err = decode_operand(&f, 0, &MemoryPool::default()).unwrap_err();
        assert_eq!(err.to_string(), "unsupported filter category: test-category");
    }

    #[test]
    fn test_no_pool() {
        let f = filter(ARG_OCTAL, &[]);
        assert_eq!(decode_operand(&f, 0o644, &NoPool).unwrap().to_string(), "#o0644");

        let s = filter(ARG_STRING_OFFSET, &[]);
        assert!(decode_operand(&s, 0, &NoPool).is_err());
    }
}
