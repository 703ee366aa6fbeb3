//! DBUS_COOKIE_SHA1 keyring access.
//!
//! Cookies live in `~/.dbus-keyrings/<context>`, one `id ctime cookie-hex`
//! entry per line. The directory must be private to the current user; a
//! keyring writable by group or other is refused outright, matching the
//! reference implementation. The directory is injected rather than read
//! from the environment at use time, so tests can point the mechanism at a
//! fixture.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Directory name under the user's home.
const KEYRING_DIR_NAME: &str = ".dbus-keyrings";

/// Handle on a cookie keyring directory.
#[derive(Debug, Clone)]
pub struct CookieKeyring {
    dir: Option<PathBuf>,
}

impl CookieKeyring {
    /// The conventional `$HOME/.dbus-keyrings` location.
    pub fn default_location() -> Self {
        let dir = std::env::var_os("HOME").map(|home| Path::new(&home).join(KEYRING_DIR_NAME));
        CookieKeyring { dir }
    }

    /// A keyring rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        CookieKeyring {
            dir: Some(dir.into()),
        }
    }

    /// Find the cookie with `cookie_id` in the keyring file for `context`.
    pub fn lookup(&self, context: &str, cookie_id: &str) -> Result<String> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| Error::SaslCookie("no keyring directory available".into()))?;

        // A context name is used as a file name; refuse anything that could
        // escape the keyring directory.
        if context.is_empty() || context.contains('/') || context.contains('.') {
            return Err(Error::SaslCookie(format!(
                "illegal cookie context {context:?}"
            )));
        }

        self.check_permissions(dir)?;

        let file = dir.join(context);
        let contents = std::fs::read_to_string(&file).map_err(|e| {
            Error::SaslCookie(format!("cannot read cookie file {}: {e}", file.display()))
        })?;

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(_ctime), Some(cookie)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if id == cookie_id {
                debug!(context, cookie_id, "cookie found");
                return Ok(cookie.to_owned());
            }
        }

        Err(Error::SaslCookie(format!(
            "no cookie with id {cookie_id} in context {context}"
        )))
    }

    /// The keyring directory must be accessible by the owner only.
    #[cfg(unix)]
    fn check_permissions(&self, dir: &Path) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(dir).map_err(|e| {
            Error::SaslCookie(format!("cannot stat keyring {}: {e}", dir.display()))
        })?;
        if !metadata.is_dir() {
            return Err(Error::SaslCookie(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mode = metadata.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(Error::SaslCookie(format!(
                "keyring {} has mode {mode:03o}, must not be group/other accessible",
                dir.display()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}
