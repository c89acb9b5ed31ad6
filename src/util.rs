// Carve up a line of text into space-separated chunks + the start indices of the chunks.
pub fn chunks(input: &str) -> (Vec<usize>, Vec<&str>) {
    let mut start_indices: Vec<usize> = Vec::new();
    let mut parts: Vec<&str> = Vec::new();

    let mut last_index = 0;
    for (index, c) in input.char_indices() {
        if c.is_whitespace() {
            if last_index != index {
                start_indices.push(last_index);
                parts.push(&input[last_index..index]);
            }
            last_index = index + 1;
        }
    }

    if last_index < input.len() {
        start_indices.push(last_index);
        parts.push(&input[last_index..]);
    }

    (start_indices, parts)
}

// Quote a string so it can be pasted into a shell: pass it through bare if every character
// is shell-safe, otherwise wrap in single quotes and escape embedded single quotes as '\''.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
    });
    if safe {
        return s.to_string();
    }
    let mut t = "'".to_string();
    for c in s.chars() {
        if c == '\'' {
            t.push_str("'\\''");
        } else {
            t.push(c);
        }
    }
    t.push('\'');
    t
}

// True iff an executable with the given name exists somewhere on PATH.
pub fn which(name: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let path = match std::env::var("PATH") {
        Ok(p) => p,
        Err(_) => return false,
    };
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = std::path::Path::new(dir).join(name);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return true;
            }
        }
    }
    false
}

#[test]
pub fn chunks_test() {
    let (ix, parts) = chunks("  a bb   ccc");
    assert!(ix == vec![2, 4, 9]);
    assert!(parts == vec!["a", "bb", "ccc"]);
    let (ix, parts) = chunks("");
    assert!(ix.is_empty() && parts.is_empty());
}

#[test]
pub fn shell_quote_test() {
    assert!(&shell_quote("abcde") == "abcde");
    assert!(&shell_quote("data/a.txt") == "data/a.txt");
    assert!(&shell_quote("a b") == "'a b'");
    assert!(&shell_quote("it's") == r#"'it'\''s'"#);
    assert!(&shell_quote("") == "''");
}
