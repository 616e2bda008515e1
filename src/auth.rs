//! Credentials for the control port.
//!
//! The session authenticates exactly once, as the first step of its
//! startup sequence. Four credential forms are supported: no credential,
//! a password, a cookie (read from disk or given as bytes), and the
//! SAFECOOKIE challenge/response exchange.

use crate::error::{ControlError, Result};
use crate::protocol::{format_command, quote_string};
use hmac::{Hmac, Mac};
use rand::distr::{Alphanumeric, SampleString};
use sha2::Sha256;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const SERVER_TO_CONTROLLER: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CONTROLLER_TO_SERVER: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Length of passwords produced by [`generate_password`].
pub const PASSWORD_LEN: usize = 16;

/// Length of an authentication cookie and of SAFECOOKIE nonces.
pub const COOKIE_LEN: usize = 32;

/// Credential presented by `AUTHENTICATE`.
#[derive(Debug, Clone, Default)]
pub enum AuthCredential {
    /// No credential.
    #[default]
    None,
    /// Control password, sent quoted.
    Password(String),
    /// Cookie file path - read when authenticating.
    CookieFile(String),
    /// Raw cookie data (32 bytes).
    CookieData(Vec<u8>),
    /// SAFECOOKIE challenge/response using the cookie at `cookie_path`.
    SafeCookie {
        /// Path to the cookie file.
        cookie_path: String,
    },
}

impl AuthCredential {
    /// Create password credentials.
    pub fn password(password: impl Into<String>) -> Self {
        AuthCredential::Password(password.into())
    }

    /// Create cookie file credentials.
    pub fn cookie_file(path: impl Into<String>) -> Self {
        AuthCredential::CookieFile(path.into())
    }

    /// Create safe cookie credentials.
    pub fn safe_cookie(cookie_path: impl Into<String>) -> Self {
        AuthCredential::SafeCookie {
            cookie_path: cookie_path.into(),
        }
    }

    /// The single `AUTHENTICATE` command for this credential.
    ///
    /// Fails for SAFECOOKIE, which needs a challenge round-trip first, and
    /// when a cookie cannot be read.
    pub fn authenticate_command(&self) -> Result<String> {
        match self {
            AuthCredential::None => Ok(format_command("AUTHENTICATE", &[])),
            AuthCredential::Password(password) => {
                Ok(format_command("AUTHENTICATE", &[&quote_string(password)]))
            }
            AuthCredential::CookieFile(path) => {
                let cookie = read_cookie_file(Path::new(path))?;
                Ok(format_command("AUTHENTICATE", &[&hex::encode_upper(cookie)]))
            }
            AuthCredential::CookieData(cookie) => {
                check_cookie_len(cookie.len())?;
                Ok(format_command("AUTHENTICATE", &[&hex::encode_upper(cookie)]))
            }
            AuthCredential::SafeCookie { .. } => Err(ControlError::InvalidArgument(
                "SAFECOOKIE needs a challenge exchange".to_string(),
            )),
        }
    }
}

/// Random alphanumeric control password for a daemon the host launches.
pub fn generate_password() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), PASSWORD_LEN)
}

fn check_cookie_len(len: usize) -> Result<()> {
    if len != COOKIE_LEN {
        return Err(ControlError::AuthenticationRejected(format!(
            "Cookie has invalid length {} (expected {})",
            len, COOKIE_LEN
        )));
    }
    Ok(())
}

/// Read the authentication cookie from a file.
pub fn read_cookie_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        ControlError::AuthenticationRejected(format!(
            "Failed to read cookie file '{}': {}",
            path.display(),
            e
        ))
    })?;
    check_cookie_len(data.len())?;
    Ok(data)
}

/// Generate a random client nonce for SAFECOOKIE authentication.
pub fn generate_client_nonce() -> [u8; COOKIE_LEN] {
    use rand::Rng;
    let mut nonce = [0u8; COOKIE_LEN];
    rand::rng().fill(&mut nonce);
    nonce
}

fn safecookie_hash(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ControlError::ProtocolError(format!("HMAC setup failed: {}", e)))?;
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    Ok(hash)
}

/// Hash the daemon must present in its AUTHCHALLENGE reply.
pub fn compute_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    safecookie_hash(SERVER_TO_CONTROLLER, cookie, client_nonce, server_nonce)
}

/// Hash the controller sends back with `AUTHENTICATE`.
pub fn compute_client_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    safecookie_hash(CONTROLLER_TO_SERVER, cookie, client_nonce, server_nonce)
}

/// Parse `AUTHCHALLENGE SERVERHASH=<hex> SERVERNONCE=<hex>`.
pub fn parse_authchallenge_response(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut server_hash = None;
    let mut server_nonce = None;

    for part in text.split_whitespace() {
        if let Some(hash) = part.strip_prefix("SERVERHASH=") {
            server_hash = Some(hex::decode(hash).map_err(|e| {
                ControlError::ProtocolError(format!("Invalid SERVERHASH hex: {}", e))
            })?);
        } else if let Some(nonce) = part.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(hex::decode(nonce).map_err(|e| {
                ControlError::ProtocolError(format!("Invalid SERVERNONCE hex: {}", e))
            })?);
        }
    }

    let server_hash =
        server_hash.ok_or_else(|| ControlError::ProtocolError("Missing SERVERHASH".to_string()))?;
    let server_nonce = server_nonce
        .ok_or_else(|| ControlError::ProtocolError("Missing SERVERNONCE".to_string()))?;

    if server_hash.len() != 32 || server_nonce.len() != COOKIE_LEN {
        return Err(ControlError::ProtocolError(format!(
            "Invalid AUTHCHALLENGE lengths: hash {}, nonce {}",
            server_hash.len(),
            server_nonce.len()
        )));
    }

    Ok((server_hash, server_nonce))
}

/// Check the daemon's hash in constant time.
pub fn verify_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    expected_hash: &[u8],
) -> Result<bool> {
    let computed = compute_server_hash(cookie, client_nonce, server_nonce)?;
    Ok(constant_time_compare(&computed, expected_hash))
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(feature = "tokio-runtime")]
pub use exchange::authenticate;

#[cfg(feature = "tokio-runtime")]
mod exchange {
    use super::*;
    use crate::pipeline::CommandSender;
    use tracing::debug;

    fn rejected(error: ControlError) -> ControlError {
        match error {
            ControlError::CommandRejected { code, message } => {
                ControlError::AuthenticationRejected(format!("{} {}", code, message))
            }
            other => other,
        }
    }

    /// Run the authentication step through the command pipeline.
    ///
    /// Any rejection by the daemon becomes
    /// [`ControlError::AuthenticationRejected`].
    pub async fn authenticate(commands: &CommandSender, credential: &AuthCredential) -> Result<()> {
        let command = match credential {
            AuthCredential::SafeCookie { cookie_path } => {
                safe_cookie_command(commands, Path::new(cookie_path)).await?
            }
            other => other.authenticate_command()?,
        };
        commands.execute(command).await.map_err(rejected)?;
        debug!("Authenticated");
        Ok(())
    }

    async fn safe_cookie_command(commands: &CommandSender, cookie_path: &Path) -> Result<String> {
        let cookie = read_cookie_file(cookie_path)?;
        let client_nonce = generate_client_nonce();

        let challenge = format_command(
            "AUTHCHALLENGE",
            &["SAFECOOKIE", &hex::encode_upper(client_nonce)],
        );
        let lines = commands.execute(challenge).await.map_err(rejected)?;
        let reply = lines
            .iter()
            .find(|l| l.starts_with("AUTHCHALLENGE"))
            .ok_or_else(|| ControlError::ProtocolError("No AUTHCHALLENGE reply".to_string()))?;
        let (server_hash, server_nonce) = parse_authchallenge_response(reply)?;

        if !verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash)? {
            return Err(ControlError::AuthenticationRejected(
                "Server hash mismatch".to_string(),
            ));
        }

        let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce)?;
        Ok(format_command("AUTHENTICATE", &[&hex::encode_upper(client_hash)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_commands() {
        assert_eq!(
            AuthCredential::None.authenticate_command().unwrap(),
            "AUTHENTICATE\r\n"
        );
        assert_eq!(
            AuthCredential::password("s3cret").authenticate_command().unwrap(),
            "AUTHENTICATE \"s3cret\"\r\n"
        );
        let cookie = AuthCredential::CookieData(vec![0xab; 32]);
        assert_eq!(
            cookie.authenticate_command().unwrap(),
            format!("AUTHENTICATE {}\r\n", "AB".repeat(32))
        );
    }

    #[test]
    fn test_bad_cookie_length() {
        let cookie = AuthCredential::CookieData(vec![0; 8]);
        assert!(matches!(
            cookie.authenticate_command(),
            Err(ControlError::AuthenticationRejected(_))
        ));
        assert!(AuthCredential::safe_cookie("/x").authenticate_command().is_err());
    }

    #[test]
    fn test_generate_password() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password());
    }

    #[test]
    fn test_client_nonce_generation() {
        assert_ne!(generate_client_nonce(), generate_client_nonce());
    }

    #[test]
    fn test_hmac_computation() {
        let cookie = [0u8; 32];
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];

        let server_hash = compute_server_hash(&cookie, &client_nonce, &server_nonce).unwrap();
        let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce).unwrap();
        assert_ne!(server_hash, client_hash);

        assert!(verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash).unwrap());
        assert!(!verify_server_hash(&cookie, &client_nonce, &server_nonce, &client_hash).unwrap());
    }

    #[test]
    fn test_parse_authchallenge() {
        let text = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            "01".repeat(32),
            "02".repeat(32)
        );
        let (hash, nonce) = parse_authchallenge_response(&text).unwrap();
        assert_eq!(hash, vec![1u8; 32]);
        assert_eq!(nonce, vec![2u8; 32]);

        assert!(parse_authchallenge_response("AUTHCHALLENGE SERVERHASH=00").is_err());
    }
}
