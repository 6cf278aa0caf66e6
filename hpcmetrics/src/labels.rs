// Normalize free text (lab names, billing codes, group descriptions) into tokens that are legal
// as time-series tag values.
//
// The same raw string must always go through `labelize` before it is used as a tag, otherwise
// one logical resource turns into several series that never merge.

/// Collapse whitespace runs, drop whitespace next to a parenthesis, then map ' ' -> '_',
/// '(' and ')' -> '/', ',' -> '.', '&' -> "and".  The output contains none of the mapped
/// characters, so `labelize(labelize(s)) == labelize(s)`.

pub fn labelize(s: &str) -> String {
    let words = s.split_whitespace().collect::<Vec<&str>>().join(" ");
    let mut out = String::with_capacity(words.len());
    let chars = words.chars().collect::<Vec<char>>();
    for (i, &c) in chars.iter().enumerate() {
        match c {
            ' ' => {
                let before = if i > 0 { chars[i - 1] } else { ' ' };
                let after = chars.get(i + 1).copied().unwrap_or(' ');
                if !is_paren(before) && !is_paren(after) {
                    out.push('_');
                }
            }
            '(' | ')' => out.push('/'),
            ',' => out.push('.'),
            '&' => out.push_str("and"),
            c => out.push(c),
        }
    }
    out
}

fn is_paren(c: char) -> bool {
    c == '(' || c == ')'
}

#[test]
fn test_labelize() {
    assert!(labelize("MR 7T (new)") == "MR_7T/new/");
    assert!(labelize("Prisma") == "Prisma");
    assert!(labelize("EEG  lab 1") == "EEG_lab_1");
    assert!(labelize("Sales & Marketing, Inc") == "Sales_and_Marketing._Inc");
    assert!(labelize("Skyra (old) upstairs") == "Skyra/old/upstairs");
    assert!(labelize("  padded  ") == "padded");
    assert!(labelize("") == "");
}

#[test]
fn test_labelize_idempotent() {
    for s in ["MR 7T (new)", "a  b", "x&y", "(p, q)", "already_clean", "A ( b ) c"] {
        let once = labelize(s);
        assert!(labelize(&once) == once, "not idempotent for {s:?}");
    }
}
