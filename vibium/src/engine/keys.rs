//! Named key resolution for `press` and `keys`.
//!
//! Named keys map onto the W3C WebDriver private-use codepoints that BiDi
//! `input.performActions` understands; single characters pass through
//! unchanged.

use phf::phf_map;

use crate::error::{EngineError, Result};

static KEY_CODES: phf::Map<&'static str, char> = phf_map! {
    "Unidentified" => '\u{E000}',
    "Cancel" => '\u{E001}',
    "Help" => '\u{E002}',
    "Backspace" => '\u{E003}',
    "Tab" => '\u{E004}',
    "Clear" => '\u{E005}',
    "Return" => '\u{E006}',
    "Enter" => '\u{E007}',
    "Shift" => '\u{E008}',
    "Control" => '\u{E009}',
    "Alt" => '\u{E00A}',
    "Pause" => '\u{E00B}',
    "Escape" => '\u{E00C}',
    "Space" => '\u{E00D}',
    "PageUp" => '\u{E00E}',
    "PageDown" => '\u{E00F}',
    "End" => '\u{E010}',
    "Home" => '\u{E011}',
    "ArrowLeft" => '\u{E012}',
    "ArrowUp" => '\u{E013}',
    "ArrowRight" => '\u{E014}',
    "ArrowDown" => '\u{E015}',
    "Insert" => '\u{E016}',
    "Delete" => '\u{E017}',
    "Semicolon" => '\u{E018}',
    "Equals" => '\u{E019}',
    "Numpad0" => '\u{E01A}',
    "Numpad1" => '\u{E01B}',
    "Numpad2" => '\u{E01C}',
    "Numpad3" => '\u{E01D}',
    "Numpad4" => '\u{E01E}',
    "Numpad5" => '\u{E01F}',
    "Numpad6" => '\u{E020}',
    "Numpad7" => '\u{E021}',
    "Numpad8" => '\u{E022}',
    "Numpad9" => '\u{E023}',
    "Multiply" => '\u{E024}',
    "Add" => '\u{E025}',
    "Separator" => '\u{E026}',
    "Subtract" => '\u{E027}',
    "Decimal" => '\u{E028}',
    "Divide" => '\u{E029}',
    "F1" => '\u{E031}',
    "F2" => '\u{E032}',
    "F3" => '\u{E033}',
    "F4" => '\u{E034}',
    "F5" => '\u{E035}',
    "F6" => '\u{E036}',
    "F7" => '\u{E037}',
    "F8" => '\u{E038}',
    "F9" => '\u{E039}',
    "F10" => '\u{E03A}',
    "F11" => '\u{E03B}',
    "F12" => '\u{E03C}',
    "Meta" => '\u{E03D}',
};

/// Common aliases seen in agent input.
static KEY_ALIASES: phf::Map<&'static str, &'static str> = phf_map! {
    "Ctrl" => "Control",
    "Cmd" => "Meta",
    "Command" => "Meta",
    "Super" => "Meta",
    "Option" => "Alt",
    "Esc" => "Escape",
    "Del" => "Delete",
    "Ins" => "Insert",
    "PgUp" => "PageUp",
    "PgDn" => "PageDown",
    "Left" => "ArrowLeft",
    "Up" => "ArrowUp",
    "Right" => "ArrowRight",
    "Down" => "ArrowDown",
};

/// Resolve a key name to the character sent over `input.performActions`.
pub fn resolve_key(name: &str) -> Result<char> {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Ok(c);
    }
    let canonical = KEY_ALIASES.get(name).copied().unwrap_or(name);
    KEY_CODES.get(canonical).copied().ok_or_else(|| {
        EngineError::invalid(format!(
            "unknown key {name:?}; expected a single character or a named key like Enter"
        ))
    })
}

/// Whether the key acts as a modifier in a combo.
pub fn is_modifier(key: char) -> bool {
    matches!(key, '\u{E008}' | '\u{E009}' | '\u{E00A}' | '\u{E03D}')
}

/// Split `A+B+C` into resolved keys. An empty segment escapes a literal `+`
/// (`Control++`).
pub fn split_combo(combo: &str) -> Result<Vec<char>> {
    if combo.is_empty() {
        return Err(EngineError::invalid("empty key combination"));
    }
    let mut keys = Vec::new();
    let mut segment = String::new();
    let mut chars = combo.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '+' {
            if segment.is_empty() && (chars.peek().is_none() || chars.peek() == Some(&'+')) {
                // literal plus
                segment.push('+');
                continue;
            }
            keys.push(resolve_key(&segment)?);
            segment.clear();
        } else {
            segment.push(c);
        }
    }
    if segment.is_empty() {
        return Err(EngineError::invalid(format!(
            "malformed key combination {combo:?}"
        )));
    }
    keys.push(resolve_key(&segment)?);
    Ok(keys)
}

/// Split a combo into (modifiers, main key). The last key is the main one;
/// everything before it must be a modifier.
pub fn parse_chord(combo: &str) -> Result<(Vec<char>, char)> {
    let mut keys = split_combo(combo)?;
    let main = keys.pop().expect("split_combo yields at least one key");
    if let Some(bad) = keys.iter().find(|k| !is_modifier(**k)) {
        return Err(EngineError::invalid(format!(
            "only modifiers may precede the main key in {combo:?} (offending codepoint {:?})",
            bad
        )));
    }
    Ok((keys, main))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_resolve_to_webdriver_codepoints() {
        assert_eq!(resolve_key("Enter").unwrap(), '\u{E007}');
        assert_eq!(resolve_key("Tab").unwrap(), '\u{E004}');
        assert_eq!(resolve_key("ArrowUp").unwrap(), '\u{E013}');
        assert_eq!(resolve_key("F1").unwrap(), '\u{E031}');
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(resolve_key("Ctrl").unwrap(), '\u{E009}');
        assert_eq!(resolve_key("Esc").unwrap(), '\u{E00C}');
    }

    #[test]
    fn single_characters_pass_through() {
        assert_eq!(resolve_key("a").unwrap(), 'a');
        assert_eq!(resolve_key("+").unwrap(), '+');
        assert_eq!(resolve_key("ß").unwrap(), 'ß');
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(resolve_key("Bogus").is_err());
    }

    #[test]
    fn chords_split_into_modifiers_and_main() {
        let (mods, main) = parse_chord("Control+Shift+T").unwrap();
        assert_eq!(mods, vec!['\u{E009}', '\u{E008}']);
        assert_eq!(main, 'T');

        let (mods, main) = parse_chord("Control+a").unwrap();
        assert_eq!(mods, vec!['\u{E009}']);
        assert_eq!(main, 'a');
    }

    #[test]
    fn non_modifier_prefix_is_rejected() {
        assert!(parse_chord("a+b").is_err());
    }

    #[test]
    fn literal_plus_in_combo() {
        let (mods, main) = parse_chord("Control++").unwrap();
        assert_eq!(mods, vec!['\u{E009}']);
        assert_eq!(main, '+');
    }
}
