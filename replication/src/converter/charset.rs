//! MySQL charset name -> encoding label used to decode binary text columns.

use encoding::label::encoding_from_whatwg_label;
use encoding::types::EncodingRef;

/// Fixed mapping of MySQL charset names to WHATWG encoding labels.
/// Charsets without a runtime counterpart map to `None` and fall back to
/// UTF-8 at decode time.
const CHARSET_MAP: &[(&str, Option<&str>)] = &[
    ("armscii8", None),
    ("ascii", Some("windows-1252")),
    ("big5", Some("big5")),
    ("binary", Some("latin1")),
    ("cp1250", Some("windows-1250")),
    ("cp1251", Some("windows-1251")),
    ("cp1256", Some("windows-1256")),
    ("cp1257", Some("windows-1257")),
    ("cp850", Some("ibm866")),
    ("cp852", None),
    ("cp866", Some("ibm866")),
    ("cp932", Some("shift_jis")),
    ("dec8", Some("latin1")),
    ("eucjpms", Some("euc-jp")),
    ("euckr", Some("euc-kr")),
    ("gb18030", Some("gb18030")),
    ("gb2312", Some("gbk")),
    ("gbk", Some("gbk")),
    ("geostd8", None),
    ("greek", Some("iso-8859-7")),
    ("hebrew", Some("iso-8859-8")),
    ("hp8", None),
    ("keybcs2", None),
    ("koi8r", Some("koi8-r")),
    ("koi8u", Some("koi8-u")),
    // MySQL's latin1 is Windows-1252 in practice
    ("latin1", Some("windows-1252")),
    ("latin2", Some("iso-8859-2")),
    ("latin5", Some("windows-1254")),
    ("latin7", Some("iso-8859-13")),
    ("macce", None),
    ("macroman", Some("macintosh")),
    ("sjis", Some("shift_jis")),
    ("swe7", None),
    ("tis620", Some("windows-874")),
    ("ucs2", Some("utf-16be")),
    ("ujis", Some("euc-jp")),
    ("utf16", Some("utf-16be")),
    ("utf16le", Some("utf-16le")),
    ("utf32", None),
    ("utf8mb3", Some("utf-8")),
    ("utf8mb4", Some("utf-8")),
    ("utf8", Some("utf-8")),
];

/// Resolve a MySQL charset name to a decoder; unknown or unsupported
/// charsets yield `None` and the caller decodes as UTF-8.
pub fn encoding_for_charset(charset: &str) -> Option<EncodingRef> {
    let label = CHARSET_MAP
        .iter()
        .find(|(name, _)| *name == charset.to_lowercase())
        .and_then(|(_, label)| *label)?;
    encoding_from_whatwg_label(label)
}

/// Decode text bytes using the table's declared charset, falling back to
/// lossy UTF-8.
pub fn decode_text(bytes: &[u8], charset: &str) -> String {
    if let Some(encoding) = encoding_for_charset(charset) {
        if let Ok(decoded) = encoding.decode(bytes, encoding::DecoderTrap::Replace) {
            return decoded;
        }
    }
    String::from_utf8_lossy(bytes).to_string()
}
