//! URL 路径前缀：拼接服务端前缀与用户前缀，并从请求路径中剥离。

/// 拼接服务端前缀与用户子前缀，得到用于剥离请求路径的前缀。
///
/// 两段之间只保留一个 `/`，反斜杠统一为 `/`，结果不带结尾的 `/`。
pub fn build_http_path_prefix(server_prefix: &str, user_prefix: &str) -> String {
    if user_prefix.is_empty() {
        return normalize_prefix(server_prefix);
    }
    if server_prefix.is_empty() {
        return normalize_prefix(user_prefix);
    }
    normalize_prefix(&format!("{server_prefix}/{user_prefix}"))
}

/// 词法规范化：合并重复分隔符，处理 `.` 与 `..`，去掉结尾的 `/`。
pub fn normalize_prefix(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute && !joined.is_empty() {
        format!("/{joined}")
    } else {
        joined
    }
}

/// 按路径段边界剥离前缀，返回剩余部分（为空或以 `/` 开头）。
///
/// 前缀有无开头的 `/` 等价；不匹配时返回 None。
pub fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix('/').unwrap_or(path).strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
