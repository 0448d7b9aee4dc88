//! Credentials applied to spawned processes

/// User and group a spawned process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// The daemon's own effective uid/gid
    #[cfg(unix)]
    pub fn effective() -> Self {
        // SAFETY: geteuid/getegid have no preconditions and cannot fail
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self { uid, gid }
    }

    #[cfg(not(unix))]
    pub fn effective() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_effective_matches_process() {
        let creds = Credentials::effective();
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        assert_eq!(creds, Credentials { uid, gid });
    }
}
