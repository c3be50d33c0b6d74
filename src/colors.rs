//! Colour and formatting markup.
//!
//! Outbound text may carry bracket tags which are rewritten to their
//! mIRC wire-level control bytes at enqueue time:
//!
//! | tag | bytes |
//! |-----|-------|
//! | `[COLOR=FG]` | `0x03NN` |
//! | `[COLOR=FG/BG]` | `0x03NN,MM` |
//! | `[/COLOR]` | `0x0F` |
//! | `[B]` / `[/B]` | `0x02` |
//! | `[U]` / `[/U]` | `0x1F` |
//! | `[I]` / `[/I]` | `0x16` |
//!
//! Unknown tags pass through verbatim. Unknown colour names fall back to
//! `LIGHTGRAY`.

/// The 16 mIRC colours, in palette order.
pub const COLOR_NAMES: [&str; 16] = [
    "WHITE", "BLACK", "DARKBLUE", "DARKGREEN", "RED", "BROWN", "PURPLE", "OLIVE", "YELLOW",
    "GREEN", "TEAL", "CYAN", "BLUE", "MAGENTA", "DARKGRAY", "LIGHTGRAY",
];

/// Palette index of a colour name; unknown names map to `LIGHTGRAY`.
pub fn color_index(name: &str) -> u8 {
    COLOR_NAMES
        .iter()
        .position(|&c| c == name)
        .unwrap_or(15) as u8
}

/// Longest tag body we will interpret; anything longer passes through.
const MAX_TAG_LEN: usize = 30;

fn tag_replacement(tag: &str) -> Option<String> {
    match tag {
        "/COLOR" => Some("\x0f".to_string()),
        "B" | "/B" => Some("\x02".to_string()),
        "U" | "/U" => Some("\x1f".to_string()),
        "I" | "/I" => Some("\x16".to_string()),
        _ => {
            let colors = tag.strip_prefix("COLOR=")?;
            match colors.split_once('/') {
                Some((fg, bg)) => Some(format!(
                    "\x03{:02},{:02}",
                    color_index(fg),
                    color_index(bg)
                )),
                None => Some(format!("\x03{:02}", color_index(colors))),
            }
        }
    }
}

/// Rewrite bracket markup in `input` to wire-level control bytes.
pub fn rewrite_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];

        let close = after.find(']');
        let replaced = close.and_then(|idx| {
            let body = &after[1..idx];
            if body.is_empty() || body.len() > MAX_TAG_LEN {
                None
            } else {
                tag_replacement(body)
            }
        });

        match (replaced, close) {
            (Some(bytes), Some(idx)) => {
                out.push_str(&bytes);
                rest = &after[idx + 1..];
            }
            (None, Some(idx)) => {
                // Unknown tag, keep it byte for byte
                out.push_str(&after[..idx + 1]);
                rest = &after[idx + 1..];
            }
            (None, None) => {
                out.push_str(after);
                rest = "";
            }
            (Some(_), None) => unreachable!(),
        }
    }

    out.push_str(rest);
    out
}
