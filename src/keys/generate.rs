//! Creating new keys.
//!
//! A generator only creates the files of a key and stamps its creation
//! time. Publishing and activating the key is left to the caller, which
//! records those stages through the key store.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use domain::base::iana::{Class, DigestAlgorithm, SecurityAlgorithm};
use domain::base::zonefile_fmt::{DisplayKind, ZonefileFmt};
use domain::base::{Name, Record, Ttl};
use domain::crypto::sign::GenerateParams;
use domain::dnssec::common::display_as_bind;
use domain::dnssec::validator::base::DnskeyExt;
use domain::rdata::Ds;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::util;

use super::keyfile;
use super::{Role, Timing};

/// Maximum tries to generate a new key with a key tag that does not
/// conflict with the key tags of existing keys.
const MAX_KEY_TAG_TRIES: u8 = 10;

/// The default size of RSA keys.
const DEFAULT_RSA_BITS: u32 = 2048;

//------------ KeyParameters -------------------------------------------------

/// Parameters for creating a new key.
///
/// The textual form is the algorithm mnemonic, for RSA optionally followed
/// by a colon and the key size in bits, e.g. `RSASHA256:3072`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyParameters {
    /// The RSASHA256 algorithm with the key length in bits.
    RsaSha256(u32),
    /// The RSASHA512 algorithm with the key length in bits.
    RsaSha512(u32),
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
    Ed448,
}

impl KeyParameters {
    /// The algorithm mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            KeyParameters::RsaSha256(_) => "RSASHA256",
            KeyParameters::RsaSha512(_) => "RSASHA512",
            KeyParameters::EcdsaP256Sha256 => "ECDSAP256SHA256",
            KeyParameters::EcdsaP384Sha384 => "ECDSAP384SHA384",
            KeyParameters::Ed25519 => "ED25519",
            KeyParameters::Ed448 => "ED448",
        }
    }

    pub fn bits(&self) -> Option<u32> {
        match self {
            KeyParameters::RsaSha256(bits) | KeyParameters::RsaSha512(bits) => Some(*bits),
            _ => None,
        }
    }

    pub fn algorithm(&self) -> SecurityAlgorithm {
        self.to_generate_params().algorithm()
    }

    /// Return the GenerateParams equivalent of a KeyParameters object.
    pub fn to_generate_params(&self) -> GenerateParams {
        match self {
            KeyParameters::RsaSha256(bits) => GenerateParams::RsaSha256 { bits: *bits },
            KeyParameters::RsaSha512(bits) => GenerateParams::RsaSha512 { bits: *bits },
            KeyParameters::EcdsaP256Sha256 => GenerateParams::EcdsaP256Sha256,
            KeyParameters::EcdsaP384Sha384 => GenerateParams::EcdsaP384Sha384,
            KeyParameters::Ed25519 => GenerateParams::Ed25519,
            KeyParameters::Ed448 => GenerateParams::Ed448,
        }
    }

    /// The digest used for the DS record of a key.
    fn digest_algorithm(&self) -> DigestAlgorithm {
        match self {
            KeyParameters::EcdsaP384Sha384 => DigestAlgorithm::SHA384,
            _ => DigestAlgorithm::SHA256,
        }
    }
}

impl Default for KeyParameters {
    fn default() -> Self {
        KeyParameters::RsaSha256(DEFAULT_RSA_BITS)
    }
}

impl FromStr for KeyParameters {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, bits) = match s.split_once(':') {
            Some((algorithm, bits)) => {
                let bits = bits
                    .parse::<u32>()
                    .map_err(|_| format!("invalid key size '{bits}'"))?;
                (algorithm, Some(bits))
            }
            None => (s, None),
        };

        let params = match algorithm.to_ascii_uppercase().as_str() {
            "RSASHA256" => KeyParameters::RsaSha256(bits.unwrap_or(DEFAULT_RSA_BITS)),
            "RSASHA512" => KeyParameters::RsaSha512(bits.unwrap_or(DEFAULT_RSA_BITS)),
            other => {
                if bits.is_some() {
                    return Err(format!("algorithm {other} does not take a key size"));
                }
                match other {
                    "ECDSAP256SHA256" => KeyParameters::EcdsaP256Sha256,
                    "ECDSAP384SHA384" => KeyParameters::EcdsaP384Sha384,
                    "ED25519" => KeyParameters::Ed25519,
                    "ED448" => KeyParameters::Ed448,
                    _ => return Err(format!("unknown algorithm {algorithm}")),
                }
            }
        };
        if let Some(bits) = params.bits() {
            if !(1024..=4096).contains(&bits) {
                return Err(format!("RSA key size {bits} is outside of 1024..=4096"));
            }
        }
        Ok(params)
    }
}

impl TryFrom<String> for KeyParameters {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyParameters> for String {
    fn from(value: KeyParameters) -> Self {
        value.to_string()
    }
}

impl fmt::Display for KeyParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bits() {
            Some(bits) => write!(f, "{}:{bits}", self.mnemonic()),
            None => f.write_str(self.mnemonic()),
        }
    }
}

//------------ KeyRequest ----------------------------------------------------

/// What a generator is asked to create.
#[derive(Clone, Debug)]
pub struct KeyRequest<'a> {
    /// The zone apex with a trailing dot.
    pub zone: &'a str,
    pub role: Role,
    pub params: KeyParameters,

    /// The directory to create the key files in.
    pub dir: &'a Path,

    /// The creation time to record.
    pub now: DateTime<Utc>,

    /// Key tags already in use in the zone.
    pub existing_tags: &'a [u16],
}

//------------ KeyGenerator --------------------------------------------------

/// Something that creates the files of new keys.
pub trait KeyGenerator {
    /// Create a new key and return the base name of its files.
    fn generate(&self, request: &KeyRequest<'_>) -> Result<String, GenerationError>;
}

//------------ NativeGenerator -----------------------------------------------

/// Generates keys in-process with the crypto backends of `domain`.
///
/// Writes `.key` and `.private` files, plus a `.ds` file for key signing
/// keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeGenerator;

impl KeyGenerator for NativeGenerator {
    fn generate(&self, request: &KeyRequest<'_>) -> Result<String, GenerationError> {
        let role = request.role;
        let name = Name::<Vec<u8>>::from_str(request.zone)
            .map_err(|e| GenerationError::new(role, format!("invalid zone name: {e}")))?;
        let params = request.params.to_generate_params();

        let mut retries = MAX_KEY_TAG_TRIES;
        let (secret_key, public_key, key_tag) = loop {
            let (secret_key, public_key) = domain::crypto::sign::generate(&params, role.flags())
                .map_err(|e| GenerationError::new(role, format!("key generation failed: {e}")))?;

            let key_tag = public_key.key_tag();
            if !request.existing_tags.contains(&key_tag) {
                break (secret_key, public_key, key_tag);
            }
            if retries <= 1 {
                return Err(GenerationError::new(
                    role,
                    "unable to generate key with unique key tag",
                ));
            }
            retries -= 1;
        };

        let algorithm = public_key.algorithm();
        let base = keyfile::base_name(request.zone, algorithm.to_int(), key_tag);
        let timing = Timing::created_at(request.now);

        let ds = match role {
            Role::Ksk => {
                let digest_alg = request.params.digest_algorithm();
                let digest = public_key
                    .digest(&name, digest_alg)
                    .map_err(|e| GenerationError::new(role, format!("error creating digest: {e}")))?;
                let ds = Ds::new(key_tag, algorithm, digest_alg, digest.as_ref().to_vec())
                    .map_err(|e| GenerationError::new(role, format!("error creating DS record: {e}")))?;
                let record = Record::new(name.clone(), Class::IN, Ttl::ZERO, ds);
                Some(format!("{}\n", record.display_zonefile(DisplayKind::Simple)))
            }
            Role::Zsk => None,
        };

        let record = Record::new(name, Class::IN, Ttl::ZERO, public_key);
        let public = format!(
            "{}{}\n",
            keyfile::public_header(request.zone, role, key_tag, &timing),
            display_as_bind(&record).to_string().trim_end()
        );
        let private = keyfile::update_private(&secret_key.display_as_bind().to_string(), &timing);

        let mut files = vec![("private", private), ("key", public)];
        if let Some(ds) = ds {
            files.push(("ds", ds));
        }
        write_new_files(request.dir, &base, &files).map_err(|e| GenerationError::new(role, e))?;

        debug!("generated {role} {base}");
        Ok(base)
    }
}

/// Create the files of a new key, all or nothing.
fn write_new_files(dir: &Path, base: &str, files: &[(&str, String)]) -> Result<(), String> {
    let mut written: Vec<PathBuf> = Vec::new();
    for (extension, content) in files {
        let path = dir.join(format!("{base}.{extension}"));
        let mut file = match util::create_new_file(&path) {
            Ok(file) => file,
            Err(e) => {
                discard(&written);
                return Err(e.to_string());
            }
        };
        written.push(path.clone());
        if let Err(e) = file.write_all(content.as_bytes()).and_then(|_| file.sync_all()) {
            discard(&written);
            return Err(format!("error while writing '{}': {e}", path.display()));
        }
    }
    Ok(())
}

/// Remove the files of a key that could not be completed.
fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            warn!("unable to clean up {}: {err}", path.display());
        }
    }
}

//------------ ExternalGenerator ---------------------------------------------

/// Generates keys by running a `dnssec-keygen` compatible program.
///
/// The program is run as
/// `COMMAND -K DIR -a ALG [-b BITS] [-f KSK] -n ZONE -P none -A none ZONE`
/// and must print the base name of the new key files as its last line.
#[derive(Clone, Debug)]
pub struct ExternalGenerator {
    command: PathBuf,
}

impl ExternalGenerator {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn command(&self, request: &KeyRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-K").arg(request.dir);
        cmd.args(["-a", request.params.mnemonic()]);
        if let Some(bits) = request.params.bits() {
            cmd.args(["-b", &bits.to_string()]);
        }
        if request.role == Role::Ksk {
            cmd.args(["-f", "KSK"]);
        }
        cmd.args(["-n", "ZONE", "-P", "none", "-A", "none"]);
        cmd.arg(request.zone);
        cmd
    }
}

impl KeyGenerator for ExternalGenerator {
    fn generate(&self, request: &KeyRequest<'_>) -> Result<String, GenerationError> {
        let role = request.role;
        let mut cmd = self.command(request);
        debug!("running {cmd:?}");

        let output = cmd.output().map_err(|e| {
            GenerationError::new(
                role,
                format!("unable to run '{}': {e}", self.command.display()),
            )
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::new(
                role,
                format!(
                    "'{}' failed with {}: {}",
                    self.command.display(),
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let base = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| GenerationError::new(role, "key generator printed no key name"))?;

        let Some((owner, _, key_tag)) = keyfile::split_base_name(base) else {
            return Err(GenerationError::new(
                role,
                format!("key generator printed '{base}' instead of a key name"),
            ));
        };
        if !owner.eq_ignore_ascii_case(request.zone) {
            return Err(GenerationError::new(
                role,
                format!("key generator created a key for {owner}"),
            ));
        }
        if request.existing_tags.contains(&key_tag) {
            warn!("new {role} {base} reuses key tag {key_tag}");
        }
        if !request.dir.join(format!("{base}.key")).exists() {
            return Err(GenerationError::new(
                role,
                format!("key generator did not create {base}.key"),
            ));
        }

        Ok(base.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyState, KeyStore, TimingField};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn request<'a>(dir: &'a Path, role: Role, existing_tags: &'a [u16]) -> KeyRequest<'a> {
        KeyRequest {
            zone: "example.test.",
            role,
            params: KeyParameters::EcdsaP256Sha256,
            dir,
            now: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            existing_tags,
        }
    }

    #[test]
    fn parse_parameters() {
        assert_eq!(
            "RSASHA256".parse::<KeyParameters>(),
            Ok(KeyParameters::RsaSha256(2048))
        );
        assert_eq!(
            "rsasha512:4096".parse::<KeyParameters>(),
            Ok(KeyParameters::RsaSha512(4096))
        );
        assert_eq!(
            "ECDSAP256SHA256".parse::<KeyParameters>(),
            Ok(KeyParameters::EcdsaP256Sha256)
        );
        assert!("ED25519:256".parse::<KeyParameters>().is_err());
        assert!("RSASHA256:512".parse::<KeyParameters>().is_err());
        assert!("DSA".parse::<KeyParameters>().is_err());
        assert_eq!(KeyParameters::RsaSha256(3072).to_string(), "RSASHA256:3072");
        assert_eq!(
            serde_json::to_string(&KeyParameters::Ed25519).unwrap(),
            "\"ED25519\""
        );
    }

    #[test]
    fn native_zsk() {
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), Role::Zsk, &[]);
        let base = NativeGenerator.generate(&req).unwrap();
        assert!(base.starts_with("Kexample.test.+013+"));
        assert!(dir.path().join(format!("{base}.private")).exists());
        assert!(!dir.path().join(format!("{base}.ds")).exists());

        let store = KeyStore::new(dir.path(), "example.test.");
        let key = store.load_key(&base).unwrap();
        assert_eq!(key.role(), Role::Zsk);
        assert_eq!(key.algorithm(), SecurityAlgorithm::ECDSAP256SHA256);
        assert_eq!(key.timing().get(TimingField::Created), Some(req.now));
        assert_eq!(key.status(req.now).state, KeyState::Generated);
    }

    #[test]
    fn native_ksk_has_ds() {
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), Role::Ksk, &[]);
        let base = NativeGenerator.generate(&req).unwrap();
        let ds = fs::read_to_string(dir.path().join(format!("{base}.ds"))).unwrap();
        assert!(ds.starts_with("example.test."));
        assert!(ds.contains("DS"));

        let store = KeyStore::new(dir.path(), "example.test.");
        assert_eq!(store.load_key(&base).unwrap().role(), Role::Ksk);
    }

    #[cfg(unix)]
    #[test]
    fn external_generator() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-keygen");
        fs::write(
            &script,
            "#!/bin/sh\n\
             base=Kexample.test.+013+01234\n\
             printf '; Created: 20250101000000\\nexample.test. IN DNSKEY 257 3 13 dGVzdA==\\n' > \"$2/$base.key\"\n\
             echo \"Generating key pair.\"\n\
             echo $base\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let generator = ExternalGenerator::new(&script);
        let req = request(dir.path(), Role::Ksk, &[]);
        assert_eq!(
            generator.generate(&req).unwrap(),
            "Kexample.test.+013+01234"
        );

        let failing = ExternalGenerator::new(dir.path().join("missing"));
        assert!(failing.generate(&req).is_err());
    }
}
