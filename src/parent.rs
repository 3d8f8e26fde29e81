//! Looking for the DS records of a zone at its parent.
//!
//! A new KSK must not take over before the parent refers to it, and the
//! files of an old KSK must stay around for as long as the parent still
//! does. The lookup goes through the resolvers the system is configured
//! with.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use domain::base::iana::{DigestAlgorithm, OptRcode, SecurityAlgorithm};
use domain::base::{Name, Rtype};
use domain::rdata::Ds;
use domain::resolv::StubResolver;
use tracing::debug;

use crate::error::LookupError;
use crate::keys::{Key, KeyStore, Role};

//------------ DsRecord ------------------------------------------------------

/// The data of a DS record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DsRecord {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,

    /// The digest as upper case hex.
    pub digest: String,
}

impl DsRecord {
    pub fn new(key_tag: u16, algorithm: u8, digest_type: u8, digest: &[u8]) -> Self {
        DsRecord {
            key_tag,
            algorithm,
            digest_type,
            digest: digest.iter().map(|b| format!("{b:02X}")).collect(),
        }
    }

    /// Whether this record refers to a key.
    ///
    /// Key tag and algorithm must match. If the DS records of the key are
    /// known from its `.ds` file, a record with the same digest type must
    /// also carry the same digest.
    pub fn refers_to(&self, key: &Key, own: &[DsRecord]) -> bool {
        if self.key_tag != key.key_tag() || self.algorithm != key.algorithm().to_int() {
            return false;
        }
        let same_type: Vec<&DsRecord> = own
            .iter()
            .filter(|ds| ds.digest_type == self.digest_type)
            .collect();
        same_type.is_empty() || same_type.iter().any(|ds| ds.digest == self.digest)
    }
}

impl FromStr for DsRecord {
    type Err = String;

    /// Parse a DS record in presentation format.
    ///
    /// Owner, TTL and class before the record type are skipped, so both
    /// the lines of a `.ds` file and bare record data are accepted. The
    /// digest may be split into several words.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        let rdata = match words.iter().position(|w| w.eq_ignore_ascii_case("DS")) {
            Some(pos) => &words[pos + 1..],
            None => &words[..],
        };
        let [key_tag, algorithm, digest_type, digest @ ..] = rdata else {
            return Err(format!("'{s}' is not a DS record"));
        };
        let key_tag = key_tag
            .parse()
            .map_err(|_| format!("invalid key tag '{key_tag}'"))?;
        let algorithm = algorithm
            .parse::<u8>()
            .ok()
            .or_else(|| SecurityAlgorithm::from_mnemonic(algorithm.as_bytes()).map(|a| a.to_int()))
            .ok_or_else(|| format!("invalid algorithm '{algorithm}'"))?;
        let digest_type = digest_type
            .parse::<u8>()
            .ok()
            .or_else(|| DigestAlgorithm::from_mnemonic(digest_type.as_bytes()).map(|d| d.to_int()))
            .ok_or_else(|| format!("invalid digest type '{digest_type}'"))?;
        let digest = digest.concat().to_ascii_uppercase();
        if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid digest in '{s}'"));
        }
        Ok(DsRecord {
            key_tag,
            algorithm,
            digest_type,
            digest,
        })
    }
}

impl fmt::Display for DsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.key_tag, self.algorithm, self.digest_type, self.digest
        )
    }
}

//------------ DsLookup ------------------------------------------------------

/// Finds the DS records the parent publishes for a zone.
pub trait DsLookup {
    /// Return the DS records of the zone.
    ///
    /// A zone without DS records yields an empty list.
    fn lookup(&self, zone: &str) -> Result<Vec<DsRecord>, LookupError>;
}

//------------ ResolverLookup ------------------------------------------------

/// Looks up DS records through the system's resolvers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolverLookup;

impl DsLookup for ResolverLookup {
    fn lookup(&self, zone: &str) -> Result<Vec<DsRecord>, LookupError> {
        let name = Name::<Vec<u8>>::from_str(zone)
            .map_err(|e| LookupError::new(zone, format!("invalid zone name: {e}")))?;
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| LookupError::new(zone, format!("unable to start the resolver: {e}")))?;
        runtime
            .block_on(query_ds(&name))
            .map_err(|e| LookupError::new(zone, e))
    }
}

async fn query_ds(zone: &Name<Vec<u8>>) -> Result<Vec<DsRecord>, String> {
    let resolver = StubResolver::new();
    let answer = resolver
        .query((zone, Rtype::DS))
        .await
        .map_err(|e| format!("lookup of {zone}/DS failed: {e}"))?;
    let rcode = answer.opt_rcode();
    if rcode != OptRcode::NOERROR {
        return Err(format!("{zone}/DS query failed: {rcode}"));
    }

    let mut records = Vec::new();
    let section = answer
        .answer()
        .map_err(|e| format!("malformed answer for {zone}/DS: {e}"))?;
    for r in section.limit_to_in::<Ds<_>>() {
        let r = r.map_err(|e| format!("malformed answer for {zone}/DS: {e}"))?;
        if r.owner() != zone {
            continue;
        }
        let ds = r.data();
        records.push(DsRecord::new(
            ds.key_tag(),
            ds.algorithm().to_int(),
            ds.digest_type().to_int(),
            ds.digest().as_ref(),
        ));
    }
    debug!("{zone} has {} DS records at the parent", records.len());
    Ok(records)
}

//------------ ParentDs ------------------------------------------------------

/// Which KSKs of a zone the parent refers to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentDs {
    present: HashSet<String>,
}

impl ParentDs {
    /// Match the DS records found at the parent against the KSKs of a zone.
    pub fn new(store: &KeyStore, keys: &[Key], records: &[DsRecord]) -> Self {
        let present = keys
            .iter()
            .filter(|key| key.role() == Role::Ksk)
            .filter(|key| {
                let own = own_records(store, key);
                records.iter().any(|ds| ds.refers_to(key, &own))
            })
            .map(|key| key.base_name().to_string())
            .collect();
        ParentDs { present }
    }

    /// A view where exactly the given keys have a DS record.
    pub fn with_keys<'k>(keys: impl IntoIterator<Item = &'k str>) -> Self {
        ParentDs {
            present: keys.into_iter().map(String::from).collect(),
        }
    }

    /// Whether the parent has a DS record for the key.
    pub fn has(&self, key: &Key) -> bool {
        self.present.contains(key.base_name())
    }
}

/// The DS records of a key according to its `.ds` file.
fn own_records(store: &KeyStore, key: &Key) -> Vec<DsRecord> {
    store
        .ds_record(key)
        .map(|text| text.lines().filter_map(|line| line.parse().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Timing;
    use chrono::{TimeZone, Utc};

    fn ksk(tag: u16) -> Key {
        Key::new(
            format!("Kexample.test.+013+{tag:05}"),
            "example.test.".into(),
            Role::Ksk,
            SecurityAlgorithm::ECDSAP256SHA256,
            tag,
            Timing::created_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
        )
    }

    #[test]
    fn parse_ds_lines() {
        let ds: DsRecord = "example.test. 3600 IN DS 4242 13 2 ab12CD 34ef"
            .parse()
            .unwrap();
        assert_eq!(
            ds,
            DsRecord {
                key_tag: 4242,
                algorithm: 13,
                digest_type: 2,
                digest: "AB12CD34EF".into(),
            }
        );
        assert_eq!(
            "4242 ECDSAP256SHA256 2 AB12CD34EF".parse::<DsRecord>(),
            Ok(ds)
        );
        assert!("example.test. IN DS 4242 13 2".parse::<DsRecord>().is_err());
        assert!("example.test. IN DS 4242 13 2 XYZ".parse::<DsRecord>().is_err());
    }

    #[test]
    fn match_by_tag_algorithm_and_digest() {
        let key = ksk(4242);
        let ds = DsRecord::new(4242, 13, 2, &[0xab, 0x12]);
        assert_eq!(ds.digest, "AB12");
        assert!(ds.refers_to(&key, &[]));
        assert!(!DsRecord::new(4243, 13, 2, &[0xab, 0x12]).refers_to(&key, &[]));
        assert!(!DsRecord::new(4242, 8, 2, &[0xab, 0x12]).refers_to(&key, &[]));

        let own = [DsRecord::new(4242, 13, 2, &[0xab, 0x12])];
        assert!(ds.refers_to(&key, &own));
        assert!(!DsRecord::new(4242, 13, 2, &[0xcd]).refers_to(&key, &own));
        // Another digest type cannot be compared.
        assert!(DsRecord::new(4242, 13, 4, &[0xcd]).refers_to(&key, &own));
    }

    #[test]
    fn parent_view_uses_ds_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = KeyStore::new(dir.path(), "example.test.");
        std::fs::write(
            dir.path().join("Kexample.test.+013+00001.ds"),
            "example.test. IN DS 1 13 2 AB12\n",
        )
        .unwrap();
        let keys = [ksk(1), ksk(2)];

        let records = [
            DsRecord::new(1, 13, 2, &[0xff]),
            DsRecord::new(2, 13, 2, &[0xff]),
        ];
        let parent = ParentDs::new(&store, &keys, &records);
        assert!(!parent.has(&keys[0]));
        assert!(parent.has(&keys[1]));

        let parent = ParentDs::new(&store, &keys, &[DsRecord::new(1, 13, 2, &[0xab, 0x12])]);
        assert!(parent.has(&keys[0]));
        assert!(!parent.has(&keys[1]));
    }
}
