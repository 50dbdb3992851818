//! Sanitization of path components read from untrusted metainfo.
//!
//! Every rule here is a pure function of the input bytes and the target OS,
//! and applying a rule twice yields the same result as applying it once.
//! Nothing a remote peer puts in a torrent may escape the download
//! directory or produce a name the target filesystem rejects.

/// The filesystem component length limit we truncate to, in bytes.
const MAX_COMPONENT_LEN: usize = 255;

/// Unicode marks that can visually reorder a file name (e.g. to disguise an
/// executable extension). Dropped outright.
const DIRECTION_MARKS: &[char] = &[
    '\u{200e}', '\u{200f}', '\u{202a}', '\u{202b}', '\u{202c}', '\u{202d}',
    '\u{202e}', '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

/// The target OS for path sanitization rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TargetOs {
    Unix,
    Windows,
}

impl TargetOs {
    /// The OS this build is running on.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Windows reserved device names, which are unusable as file names no matter
/// the extension.
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5",
    "COM6", "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5",
    "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitizes a single path component from untrusted metainfo.
///
/// Returns `None` when the component must be skipped entirely (`.`, `..`,
/// or nothing left after cleaning). The caller joins the surviving
/// components into a relative path.
pub(crate) fn sanitize_path_component(
    raw: &[u8],
    os: TargetOs,
) -> Option<String> {
    // lossy is fine: invalid UTF-8 becomes U+FFFD which is a legal file name
    // character everywhere we care about
    let lossy = String::from_utf8_lossy(raw);

    // current-dir and parent-dir components are dropped, never rewritten, so
    // they can't be used to climb out of the download directory
    if lossy == "." || lossy == ".." {
        return None;
    }

    let mut out = String::with_capacity(lossy.len());
    for c in lossy.chars() {
        if DIRECTION_MARKS.contains(&c) {
            continue;
        }
        let mapped = match c {
            // control bytes and the path separators of every OS
            '\u{0}'..='\u{1f}' | '/' | '\\' => '_',
            ':' | '<' | '>' | '"' | '|' | '?' | '*' if os == TargetOs::Windows => {
                '_'
            }
            c => c,
        };
        out.push(mapped);
    }

    if os == TargetOs::Windows {
        // trailing dots and spaces are silently stripped by win32, which
        // would make distinct torrent names collide on disk
        while out.ends_with('.') || out.ends_with(' ') {
            out.pop();
        }
        let stem = out.split('.').next().unwrap_or("");
        if WINDOWS_RESERVED
            .iter()
            .any(|r| stem.eq_ignore_ascii_case(r))
        {
            return None;
        }
    }

    if out.is_empty() {
        return None;
    }

    Some(truncate_component(out))
}

/// Truncates a component to the filesystem limit, preserving the extension.
fn truncate_component(name: String) -> String {
    if name.len() <= MAX_COMPONENT_LEN {
        return name;
    }
    let (stem, ext) = split_extension(&name);
    // an extension longer than the whole budget degenerates to a plain cut
    let ext_len = ext.map(|e| e.len() + 1).unwrap_or(0);
    if ext_len >= MAX_COMPONENT_LEN {
        return cut_at_char_boundary(&name, MAX_COMPONENT_LEN).to_string();
    }
    let stem_budget = MAX_COMPONENT_LEN - ext_len;
    let stem = cut_at_char_boundary(stem, stem_budget);
    match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}

/// Appends a `.N` counter before the extension, used to disambiguate
/// colliding file names within one torrent.
pub(crate) fn disambiguate(name: &str, counter: usize) -> String {
    let (stem, ext) = split_extension(name);
    match ext {
        Some(ext) => format!("{}.{}.{}", stem, counter, ext),
        None => format!("{}.{}", stem, counter),
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        // a leading dot is a hidden file, not an extension
        Some(0) | None => (name, None),
        Some(pos) => (&name[..pos], Some(&name[pos + 1..])),
    }
}

fn cut_at_char_boundary(s: &str, mut at: usize) -> &str {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    &s[..at]
}
