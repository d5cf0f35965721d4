/// Replace `${ENV_VAR}` placeholders in config text.
///
/// `${ENV_VAR:-fallback}` uses `fallback` when the variable is unset or
/// empty. Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an injectable lookup, so tests never touch
/// the process environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder, emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match lookup(name).filter(|v| !v.is_empty()) {
            Some(value) if !name.is_empty() => result.push_str(&value),
            _ => match fallback {
                Some(fallback) => result.push_str(fallback),
                None => {
                    result.push_str("${");
                    result.push_str(body);
                    result.push('}');
                },
            },
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}
