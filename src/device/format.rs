//! printf-style formatting of device values with the `fmtstr` parameter.

use serde_json::Value;

/// Format `value` with a printf-like format string such as `%.3f` or
/// `%.2f x %.2f`. Lists supply one argument per conversion. Falls back to
/// the plain rendering when the format does not fit the value.
pub fn format_value(fmtstr: &str, value: &Value) -> String {
    let args: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        v => vec![v],
    };
    printf(fmtstr, &args).unwrap_or_else(|| plain(value))
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn printf(fmt: &str, args: &[&Value]) -> Option<String> {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut next = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            precision = Some(digits.parse::<usize>().ok()?);
        }
        let conv = chars.next()?;
        let arg = next.next()?;
        match conv {
            'f' | 'F' => out.push_str(&format!("{:.*}", precision.unwrap_or(6), arg.as_f64()?)),
            'e' => out.push_str(&format!("{:.*e}", precision.unwrap_or(6), arg.as_f64()?)),
            'g' => out.push_str(&format!("{}", arg.as_f64()?)),
            'd' | 'i' => out.push_str(&format!("{}", arg.as_f64()?.trunc() as i64)),
            's' => out.push_str(&plain(arg)),
            _ => return None,
        }
    }
    if next.next().is_some() {
        return None;
    }
    Some(out)
}
