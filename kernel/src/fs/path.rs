//! Path routing and normalization
//!
//! ModuOS has two path namespaces: `/...` targets the process's current
//! mount, `$/...` is the virtual root with `$/mnt` (mount slots) and
//! `$/dev` (device nodes) beneath it. vDrive components match
//! case-insensitively, either as `vDriveN[-P1..4]` or as the slugified
//! model name of the drive.

use alloc::string::String;
use alloc::vec::Vec;

/// Maximum path length accepted from callers
pub const MAX_PATH: usize = 256;

/// Which pseudo-directory a `$/` path landed in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevVfsKind {
    /// `$/` itself: lists "mnt" and "dev"
    Root,
    /// `$/mnt`: lists the active mount slots
    MntList,
    /// `$/dev`: top-level device nodes + "input" + "graphics"
    DevList,
    /// `$/dev/input[/...]`
    DevInput,
    /// `$/dev/graphics[/...]`
    DevGraphics,
}

/// A drive component under `$/mnt/`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriveSpec {
    /// `vDriveN` or `vDriveN-Px` (partition 1..4, 0 = whole drive)
    ById { vdrive_id: u8, partition: u8 },
    /// Anything else: matched against slugified model names
    ByName(String),
}

/// Parsed route, before mount-table resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawRoute {
    /// `/...` on the current mount; the path is taken verbatim
    Current { rel: String },
    /// `$/mnt/<drive>/...`
    Mount { drive: DriveSpec, rel: String },
    /// `$/`, `$/mnt`, `$/dev/...`
    DevVfs { kind: DevVfsKind, rel: String },
}

fn ascii_ieq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// Convert a drive model string to a path-safe slug: runs of spaces and
/// punctuation become a single `-`, everything else must be
/// alphanumeric, `-` or `_`. Trailing dashes are trimmed.
pub fn slugify_model(model: &str) -> String {
    let mut out = String::new();
    for c in model.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Parse a `vDriveN[-Px]` component (case-insensitive).
/// Returns (vdrive_id, partition index or 0).
pub fn parse_vdrive_name(name: &str) -> Option<(u8, u8)> {
    let bytes = name.as_bytes();
    if bytes.len() < 7 || !ascii_ieq(&name[..6], "vdrive") {
        return None;
    }

    let rest = &name[6..];
    let dash = rest.find('-');
    let (num, part) = match dash {
        Some(pos) => {
            let suffix = &rest[pos + 1..];
            if suffix.len() != 2 {
                return None;
            }
            let sb = suffix.as_bytes();
            if sb[0] != b'p' && sb[0] != b'P' {
                return None;
            }
            if !(sb[1] as char).is_ascii_digit() {
                return None;
            }
            (&rest[..pos], sb[1] - b'0')
        }
        None => (rest, 0),
    };

    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: u32 = num.parse().ok()?;
    if id > 255 || part > 4 {
        return None;
    }
    Some((id as u8, part))
}

/// Normalize an absolute path (`/...` or `$/...`): resolve `.` and
/// `..`, collapse duplicate separators, drop the trailing slash.
pub fn normalize(path: &str) -> String {
    let is_virtual = path.starts_with("$/");
    let body = if is_virtual { &path[2..] } else { path };

    let mut segments: Vec<&str> = Vec::new();
    for seg in body.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::new();
    if is_virtual {
        out.push_str("$/");
    } else {
        out.push('/');
    }
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(seg);
    }
    out
}

/// Split off the first component of a path body (no leading slash).
fn split_component(body: &str) -> (&str, &str) {
    let body = body.trim_start_matches('/');
    match body.find('/') {
        Some(pos) => (&body[..pos], body[pos..].trim_start_matches('/')),
        None => (body, ""),
    }
}

fn abs(rest: &str) -> String {
    let mut s = String::from("/");
    s.push_str(rest);
    normalize(&s)
}

/// Classify a path into its namespace. Leading whitespace is tolerated
/// (user input often carries it). Mount-table resolution happens later.
pub fn parse(path: &str) -> Result<RawRoute, super::FsError> {
    let path = path.trim_start();
    if path.is_empty() || path.len() > MAX_PATH {
        return Err(super::FsError::InvalidPath);
    }

    if !path.starts_with("$/") {
        let rel = if path.starts_with('/') {
            normalize(path)
        } else {
            // Relative paths are resolved against the cwd by the caller;
            // here they route verbatim onto the current mount.
            abs(path)
        };
        return Ok(RawRoute::Current { rel });
    }

    let body = path[2..].trim_start_matches('/');
    if body.is_empty() {
        return Ok(RawRoute::DevVfs {
            kind: DevVfsKind::Root,
            rel: String::from("/"),
        });
    }

    let (comp, rest) = split_component(body);

    if ascii_ieq(comp, "mnt") {
        if rest.is_empty() {
            return Ok(RawRoute::DevVfs {
                kind: DevVfsKind::MntList,
                rel: String::from("/"),
            });
        }
        let (drive, sub) = split_component(rest);
        let spec = match parse_vdrive_name(drive) {
            Some((id, part)) => DriveSpec::ById {
                vdrive_id: id,
                partition: part,
            },
            None => DriveSpec::ByName(String::from(drive)),
        };
        return Ok(RawRoute::Mount {
            drive: spec,
            rel: abs(sub),
        });
    }

    if ascii_ieq(comp, "dev") {
        if rest.is_empty() {
            return Ok(RawRoute::DevVfs {
                kind: DevVfsKind::DevList,
                rel: String::from("/"),
            });
        }
        let (sub, subrest) = split_component(rest);
        if ascii_ieq(sub, "input") {
            return Ok(RawRoute::DevVfs {
                kind: DevVfsKind::DevInput,
                rel: abs(subrest),
            });
        }
        if ascii_ieq(sub, "graphics") {
            return Ok(RawRoute::DevVfs {
                kind: DevVfsKind::DevGraphics,
                rel: abs(subrest),
            });
        }
        return Ok(RawRoute::DevVfs {
            kind: DevVfsKind::DevList,
            rel: abs(rest),
        });
    }

    Err(super::FsError::InvalidPath)
}

/// Parent directory of a normalized absolute path
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => String::from("/"),
        Some(pos) => String::from(&path[..pos]),
    }
}

/// Final component of a path
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Resolve a possibly-relative user path against a working directory.
pub fn absolutize(cwd: &str, path: &str) -> String {
    let path = path.trim_start();
    if path.starts_with('/') || path.starts_with("$/") {
        normalize(path)
    } else {
        let mut joined = String::from(cwd);
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
        normalize(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_resolves() {
        assert_eq!(normalize("/a//b///c"), "/a/b/c");
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/a/b/.."), "/a");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize("/a/"), "/a");
        assert_eq!(normalize("$/mnt/../dev"), "$/dev");
        assert_eq!(normalize("$//mnt//x"), "$/mnt/x");
    }

    #[test]
    fn test_parse_vdrive_names() {
        assert_eq!(parse_vdrive_name("vDrive0"), Some((0, 0)));
        assert_eq!(parse_vdrive_name("VDRIVE12"), Some((12, 0)));
        assert_eq!(parse_vdrive_name("vdrive3-P1"), Some((3, 1)));
        assert_eq!(parse_vdrive_name("vDrive3-p4"), Some((3, 4)));
        assert_eq!(parse_vdrive_name("vDrive"), None);
        assert_eq!(parse_vdrive_name("vDrive3-P5"), None);
        assert_eq!(parse_vdrive_name("vDrive3-X1"), None);
        assert_eq!(parse_vdrive_name("drive3"), None);
    }

    #[test]
    fn test_slugify_model() {
        assert_eq!(slugify_model("QEMU HARDDISK"), "QEMU-HARDDISK");
        assert_eq!(slugify_model("Samsung SSD 870 EVO"), "Samsung-SSD-870-EVO");
        assert_eq!(slugify_model("weird***name  "), "weird-name");
        assert_eq!(slugify_model(""), "");
    }

    #[test]
    fn test_parse_routes_current() {
        match parse("/ModuOS/System64").unwrap() {
            RawRoute::Current { rel } => assert_eq!(rel, "/ModuOS/System64"),
            other => panic!("wrong route: {:?}", other),
        }
        // leading whitespace tolerated
        match parse("  /a.txt").unwrap() {
            RawRoute::Current { rel } => assert_eq!(rel, "/a.txt"),
            other => panic!("wrong route: {:?}", other),
        }
    }

    #[test]
    fn test_parse_routes_mnt() {
        match parse("$/mnt").unwrap() {
            RawRoute::DevVfs { kind, .. } => assert_eq!(kind, DevVfsKind::MntList),
            other => panic!("wrong route: {:?}", other),
        }
        match parse("$/mnt/vDrive1-P2/boot/x").unwrap() {
            RawRoute::Mount { drive, rel } => {
                assert_eq!(
                    drive,
                    DriveSpec::ById {
                        vdrive_id: 1,
                        partition: 2
                    }
                );
                assert_eq!(rel, "/boot/x");
            }
            other => panic!("wrong route: {:?}", other),
        }
        match parse("$/mnt/QEMU-HARDDISK/a").unwrap() {
            RawRoute::Mount { drive, rel } => {
                assert_eq!(drive, DriveSpec::ByName(String::from("QEMU-HARDDISK")));
                assert_eq!(rel, "/a");
            }
            other => panic!("wrong route: {:?}", other),
        }
    }

    #[test]
    fn test_parse_routes_dev() {
        match parse("$/dev").unwrap() {
            RawRoute::DevVfs { kind, .. } => assert_eq!(kind, DevVfsKind::DevList),
            other => panic!("wrong route: {:?}", other),
        }
        match parse("$/dev/input/kbd0").unwrap() {
            RawRoute::DevVfs { kind, rel } => {
                assert_eq!(kind, DevVfsKind::DevInput);
                assert_eq!(rel, "/kbd0");
            }
            other => panic!("wrong route: {:?}", other),
        }
        match parse("$/dev/graphics/video0").unwrap() {
            RawRoute::DevVfs { kind, rel } => {
                assert_eq!(kind, DevVfsKind::DevGraphics);
                assert_eq!(rel, "/video0");
            }
            other => panic!("wrong route: {:?}", other),
        }
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(parent_of("/a/b/c"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(basename("/x"), "x");
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(absolutize("/home", "file.txt"), "/home/file.txt");
        assert_eq!(absolutize("/", "a/b"), "/a/b");
        assert_eq!(absolutize("/home", "/etc/x"), "/etc/x");
        assert_eq!(absolutize("/home", "../x"), "/x");
    }
}
