//! 8.3 short names: generation from a long name, numeric tail collision
//! resolution, the VFAT checksum, and the rules deciding whether a name needs
//! long name entries at all.

use kernel_api_types::ErrorCode;

use crate::consts::{MAX_NAME_LENGTH, SHORT_EXTENSION_LENGTH, SHORT_NAME_LENGTH, SHORT_NAME_TOTAL_LENGTH};
use crate::structures::CaseInfo;

/// Space padded `NAME    EXT`, exactly as stored in a directory entry.
pub type ShortName = [u8; SHORT_NAME_TOTAL_LENGTH];

const BANNED_CHARACTERS: &[u8] = b"\"*/:<>?\\|";

/// Legal in a long name but not in a short one, replaced with `_` in generated short names.
const LONG_NAME_ONLY_CHARACTERS: &[u8] = b"+,;=[]";

/// Largest numeric tail a short name can carry, `~999999`.
const MAX_NUMERIC_TAIL: &[u8] = b"~999999";

/// Checks a single path component for length and characters.
pub fn validate_name(name: &str) -> Result<(), ErrorCode> {
    if name.is_empty() {
        return Err(ErrorCode::BadFilename);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ErrorCode::NameTooLong);
    }

    let bad_character = |c: u8| !c.is_ascii() || c.is_ascii_control() || BANNED_CHARACTERS.contains(&c);
    if name.bytes().any(bad_character) {
        return Err(ErrorCode::BadFilename);
    }

    if name.bytes().all(|c| c == b'.' || c == b' ') {
        return Err(ErrorCode::BadFilename);
    }

    Ok(())
}

/// Splits at the last dot: `(name_length, extension_length)`.
///
/// A leading dot with nothing before it makes the whole name the extension.
fn length_of_name_and_extension(name: &[u8]) -> (usize, usize) {
    let name_length = name.iter().rposition(|&c| c == b'.').unwrap_or(name.len());

    let extension_length = if name_length == 0 {
        name.len()
    } else if name_length < name.len() {
        name.len() - name_length - 1
    } else {
        0
    };

    (name_length, extension_length)
}

fn short_name_character(c: u8) -> u8 {
    if LONG_NAME_ONLY_CHARACTERS.contains(&c) { b'_' } else { c.to_ascii_uppercase() }
}

/// Derives the initial short name for `long_name`.
///
/// Spaces and dots are dropped from the name part, everything is uppercased and
/// a `~1` tail is added whenever the conversion lost something: truncation, a
/// dropped character or one replaced with `_`. An alias without a tail is thus
/// always the name itself, so it can never shadow a different name.
pub fn generate_short_name(long_name: &str) -> ShortName {
    let bytes = long_name.as_bytes();
    let (name_length, extension_length) = length_of_name_and_extension(bytes);

    let name_bytes = &bytes[..name_length];
    let extension_bytes = bytes.get(name_length + 1..).unwrap_or_default();

    let dropped = |c: &u8| *c == b' ' || *c == b'.';
    let is_lossy = name_bytes.iter().any(dropped)
        || extension_bytes.iter().any(|&c| c == b' ')
        || bytes.iter().any(|c| LONG_NAME_ONLY_CHARACTERS.contains(c));

    let name_part = name_bytes.iter().copied().filter(|c| !dropped(c));
    let extension_part = extension_bytes.iter().copied().filter(|&c| c != b' ');

    let is_truncated = name_part.clone().count() > SHORT_NAME_LENGTH
        || extension_part.clone().count() > SHORT_EXTENSION_LENGTH;

    let mut needs_numeric_tail = is_lossy || is_truncated;
    let name_chars_to_copy = if is_truncated { SHORT_NAME_LENGTH - 2 } else { SHORT_NAME_LENGTH };

    let mut out = [b' '; SHORT_NAME_TOTAL_LENGTH];
    let mut copied = 0;
    for c in name_part.take(name_chars_to_copy) {
        out[copied] = short_name_character(c);
        copied += 1;
    }

    // Nothing usable before the extension, e.g. ".profile"
    if copied == 0 {
        needs_numeric_tail = true;
    }

    if needs_numeric_tail {
        let position = copied.min(SHORT_NAME_LENGTH - 2);
        out[position] = b'~';
        out[position + 1] = b'1';
    }

    for (i, c) in extension_part.take(SHORT_EXTENSION_LENGTH).enumerate() {
        out[SHORT_NAME_LENGTH + i] = short_name_character(c);
    }

    out
}

/// Position of a `~` followed only by digits up to the end of the name part.
fn numeric_tail_position(name: &ShortName, end_of_name: usize) -> Option<usize> {
    let tail = name[..end_of_name].iter().rposition(|&c| c == b'~')?;
    let digits = &name[tail + 1..end_of_name];

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    Some(tail)
}

/// The next candidate after `current` collided with an existing entry.
///
/// Bumps the numeric tail, widening it (and shortening the name) as it crosses a
/// power of ten. Returns `None` once `~999999` is used up.
pub fn next_short_name(current: &ShortName) -> Option<ShortName> {
    if &current[1..SHORT_NAME_LENGTH] == MAX_NUMERIC_TAIL {
        return None;
    }

    let mut next = *current;
    let end_of_name = current[..SHORT_NAME_LENGTH].iter().position(|&c| c == b' ');
    let end_of_tail = end_of_name.unwrap_or(SHORT_NAME_LENGTH);

    let Some(tail) = numeric_tail_position(current, end_of_tail) else {
        let position = end_of_name.unwrap_or(SHORT_NAME_LENGTH - 2).min(SHORT_NAME_LENGTH - 2);
        next[position] = b'~';
        next[position + 1] = b'1';
        return Some(next);
    };

    let digits = &current[tail + 1..end_of_tail];
    let would_overflow = digits.iter().all(|&c| c == b'9');
    let mut number = digits.iter().fold(0u32, |n, &c| n * 10 + (c - b'0') as u32) + 1;

    let (start, end) = if !would_overflow {
        (tail, end_of_tail)
    } else if end_of_tail != SHORT_NAME_LENGTH {
        // Room after the tail, the name keeps its length.
        (tail, end_of_tail + 1)
    } else if tail != 0 {
        (tail - 1, end_of_tail)
    } else {
        return None;
    };

    for i in (start + 1..end).rev() {
        next[i] = b'0' + (number % 10) as u8;
        number /= 10;
    }
    next[start] = b'~';

    Some(next)
}

/// The checksum every long name entry carries of its short entry's name.
pub fn checksum(name: &ShortName) -> u8 {
    name.iter().fold(0u8, |sum, &c| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c))
}

/// How a validated name is stored in a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameEncoding {
    /// A lone short entry; the case bits restore a lowercase name or extension.
    Short { name: ShortName, case_info: CaseInfo },
    /// Long name entries followed by a short entry with a generated alias.
    Long,
}

/// Case of a name part: `Some(true)` all lowercase, `Some(false)` no lowercase,
/// `None` mixed.
fn uniform_case(part: &[u8]) -> Option<bool> {
    let has_lower = part.iter().any(u8::is_ascii_lowercase);
    let has_upper = part.iter().any(u8::is_ascii_uppercase);

    match (has_lower, has_upper) {
        (true, true) => None,
        (lower, _) => Some(lower),
    }
}

/// Decides whether `name` fits a short entry as is.
pub fn classify(name: &str) -> NameEncoding {
    let bytes = name.as_bytes();
    let dots = bytes.iter().filter(|&&c| c == b'.').count();

    let (name_part, extension_part) = match bytes.iter().position(|&c| c == b'.') {
        Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
        None => (bytes, &[][..]),
    };

    let fits_8_3 = dots <= 1
        && !name_part.is_empty()
        && name_part.len() <= SHORT_NAME_LENGTH
        && extension_part.len() <= SHORT_EXTENSION_LENGTH
        && (dots == 0 || !extension_part.is_empty())
        && !bytes.iter().any(|c| *c == b' ' || LONG_NAME_ONLY_CHARACTERS.contains(c));

    if !fits_8_3 {
        return NameEncoding::Long;
    }

    let (Some(lower_name), Some(lower_extension)) = (uniform_case(name_part), uniform_case(extension_part)) else {
        return NameEncoding::Long;
    };

    let mut case_info = CaseInfo::empty();
    case_info.set(CaseInfo::LOWERCASE_NAME, lower_name);
    case_info.set(CaseInfo::LOWERCASE_EXTENSION, lower_extension);

    NameEncoding::Short { name: generate_short_name(name), case_info }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn short(name: &str) -> String {
        String::from_utf8(generate_short_name(name).to_vec()).unwrap()
    }

    fn as_short(text: &str) -> ShortName {
        text.as_bytes().try_into().unwrap()
    }

    #[test]
    fn generate() {
        assert_eq!(short("Gamer.txt"), "GAMER   TXT");
        assert_eq!(short("Very Long Gamer That Likes to Game.txt"), "VERYLO~1TXT");
        assert_eq!(short("Long.And.With.A.Buch.Of.Dots"), "LONGAN~1DOT");
        assert_eq!(short("README"), "README     ");
        assert_eq!(short("archive.tar.gz"), "ARCHIV~1GZ ");
        assert_eq!(short(".profile"), "~1      PRO");
    }

    #[test]
    fn lossy_conversions_always_get_a_tail() {
        assert_eq!(short("a+b=c.txt"), "A_B_C~1 TXT");
        assert_eq!(short("a b.txt"), "AB~1    TXT");
        assert_eq!(short("a.b.c"), "AB~1    C  ");
        assert_eq!(short("x.t t"), "X~1     TT ");
        assert_eq!(short("ABCDEFG+.TXT"), "ABCDEF~1TXT");
        assert_eq!(short("ab.txt"), "AB      TXT");
    }

    #[test]
    fn generate_is_stable_for_8_3_names() {
        for name in ["Gamer.txt", "A", "ABCDEFGH.ABC", "x.y", "kernel.elf"] {
            let first = generate_short_name(name);
            let ext_end = first[8..].iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);
            let name_end = first[..8].iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);

            let mut rederived = String::from_utf8(first[..name_end].to_vec()).unwrap();
            if ext_end != 0 {
                rederived.push('.');
                rederived.push_str(core::str::from_utf8(&first[8..8 + ext_end]).unwrap());
            }

            assert_eq!(generate_short_name(&rederived), first);
        }
    }

    #[test]
    fn next_short_name_sequence() {
        let mut current = as_short("A       TXT");
        let checkpoints = [
            (1, "A~1     TXT"),
            (10, "A~10    TXT"),
            (100, "A~100   TXT"),
            (1000, "A~1000  TXT"),
            (10000, "A~10000 TXT"),
            (100000, "A~100000TXT"),
            (999999, "A~999999TXT"),
        ];

        let mut next_checkpoint = checkpoints.iter().peekable();
        for call in 1..=999999u32 {
            current = next_short_name(&current).expect("ran out of names too early");
            if let Some(&&(at, expected)) = next_checkpoint.peek() {
                if at == call {
                    assert_eq!(current, as_short(expected));
                    next_checkpoint.next();
                }
            }
        }

        assert!(next_checkpoint.next().is_none());
        assert_eq!(next_short_name(&current), None);
    }

    #[test]
    fn full_width_names_shrink_to_fit_the_tail() {
        assert_eq!(next_short_name(&as_short("ABCDEFGHTXT")), Some(as_short("ABCDEF~1TXT")));
        assert_eq!(next_short_name(&as_short("ABCDEF~1TXT")), Some(as_short("ABCDEF~2TXT")));
        assert_eq!(next_short_name(&as_short("ABCDEF~9TXT")), Some(as_short("ABCDE~10TXT")));
        assert_eq!(next_short_name(&as_short("AB~99999TXT")), Some(as_short("A~100000TXT")));
    }

    #[test]
    fn tilde_without_digits_is_not_a_tail() {
        assert_eq!(next_short_name(&as_short("A~B     TXT")), Some(as_short("A~B~1   TXT")));
    }

    #[test]
    fn checksums() {
        assert_eq!(checksum(&as_short("LONG-N~1TXT")), 0x10);
        assert_eq!(checksum(&as_short("OTHER-~1TXT")), 0xD1);
    }

    #[test]
    fn name_validation() {
        assert_eq!(validate_name("hello.txt"), Ok(()));
        assert_eq!(validate_name("with space and dots..txt"), Ok(()));
        assert_eq!(validate_name(""), Err(ErrorCode::BadFilename));
        assert_eq!(validate_name("a?b"), Err(ErrorCode::BadFilename));
        assert_eq!(validate_name("tab\there"), Err(ErrorCode::BadFilename));
        assert_eq!(validate_name("caf\u{e9}"), Err(ErrorCode::BadFilename));
        assert_eq!(validate_name(". ."), Err(ErrorCode::BadFilename));

        let long = "x".repeat(MAX_NAME_LENGTH);
        assert_eq!(validate_name(&long), Ok(()));
        assert_eq!(validate_name(&(long + "x")), Err(ErrorCode::NameTooLong));
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify("GAMER.TXT"),
            NameEncoding::Short { name: as_short("GAMER   TXT"), case_info: CaseInfo::empty() }
        );
        assert_eq!(
            classify("readme.TXT"),
            NameEncoding::Short { name: as_short("README  TXT"), case_info: CaseInfo::LOWERCASE_NAME }
        );
        assert_eq!(
            classify("boot.cfg"),
            NameEncoding::Short {
                name: as_short("BOOT    CFG"),
                case_info: CaseInfo::LOWERCASE_NAME | CaseInfo::LOWERCASE_EXTENSION,
            }
        );
        assert_eq!(
            classify("_1.X"),
            NameEncoding::Short { name: as_short("_1      X  "), case_info: CaseInfo::empty() }
        );

        assert_eq!(classify("Gamer.txt"), NameEncoding::Long);
        assert_eq!(classify("a b.txt"), NameEncoding::Long);
        assert_eq!(classify("a.b.c"), NameEncoding::Long);
        assert_eq!(classify("toolongname.txt"), NameEncoding::Long);
        assert_eq!(classify("name.text"), NameEncoding::Long);
        assert_eq!(classify("a+b"), NameEncoding::Long);
        assert_eq!(classify(".hidden"), NameEncoding::Long);
        assert_eq!(classify("trailing."), NameEncoding::Long);
    }
}
