use byteorder::{LittleEndian, WriteBytesExt};
use zeroize::Zeroize;

/// A password for password protected archives.
///
/// Use [`Password::empty()`] when the archive is not encrypted. String
/// passwords are stored UTF-16LE encoded, the representation the 7z key
/// derivation operates on:
///
/// ```rust
/// use sevenz_stream::Password;
///
/// let password: Password = "a password string".into();
/// ```
///
/// The buffer is zeroed when the password is dropped.
#[derive(Default, Clone, PartialEq)]
pub struct Password(Vec<u8>);

impl Password {
    /// Creates a new [`Password`] from the given password string.
    pub fn new(password: &str) -> Self {
        Self::from(password)
    }

    /// Creates a new [`Password`] from raw bytes, bypassing the UTF-16LE
    /// encoding applied to string passwords.
    pub fn from_raw(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Creates an empty password.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Returns the byte representation of the password.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if the password is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl AsRef<[u8]> for Password {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() {
            "Password(empty)"
        } else {
            "Password(***)"
        })
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        let mut encoded = Vec::with_capacity(s.len() * 2);
        for unit in s.encode_utf16() {
            let _ = encoded.write_u16::<LittleEndian>(unit);
        }
        Self(encoded)
    }
}
