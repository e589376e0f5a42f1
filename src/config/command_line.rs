//! 命令行配置源
//!
//! 解析 `--key=value` 形式的命令行参数，例如 `app --env=test --set=sg --cluster=asia`。

use crate::config::source::MapPropertySource;
use std::collections::HashMap;

/// 命令行配置源名称
pub const COMMAND_LINE_SOURCE_NAME: &str = "commandLineEnvironment";

/// 解析单个参数，格式不正确时返回 `None`
///
/// 参数至少四个字符且以 `--` 开头，第一个 `=` 不能位于 key 的起始位置，
/// key 与 value 都会去除首尾空白。`--name=` 解析为空值。
pub fn parse_arg(arg: &str) -> Option<(String, String)> {
    if arg.len() < 4 {
        return None;
    }
    let rest = arg.strip_prefix("--")?.trim();
    let index = rest.find('=')?;
    if index < 1 {
        return None;
    }
    Some((
        rest[..index].trim().to_string(),
        rest[index + 1..].trim().to_string(),
    ))
}

/// 解析命令行参数及附加的命令行字符串
///
/// # 参数
/// * `args` - 命令行参数
/// * `append_command_line` - 附加命令行，按空白切分后追加在参数之后
///
/// # 返回
/// * `HashMap<String, String>` - 解析出的配置，同一个 key 以最后出现的为准
pub fn parse_command_line<I, S>(args: I, append_command_line: &str) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut properties = HashMap::new();
    let appended = append_command_line
        .split_whitespace()
        .map(str::to_string);

    let all_args = args
        .into_iter()
        .map(|arg| arg.as_ref().to_string())
        .chain(appended);

    for arg in all_args {
        if let Some((key, value)) = parse_arg(&arg) {
            properties.insert(key, value);
        }
    }
    properties
}

/// 查找单个命令行参数的值
pub fn command_line_property<I, S>(args: I, key: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if key.is_empty() {
        return None;
    }
    args.into_iter()
        .filter_map(|arg| parse_arg(arg.as_ref()))
        .find(|(k, _)| k == key)
        .map(|(_, value)| value)
}

/// 创建命令行配置源
pub fn command_line_source<I, S>(args: I, append_command_line: &str) -> MapPropertySource
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    MapPropertySource::new(
        COMMAND_LINE_SOURCE_NAME,
        parse_command_line(args, append_command_line),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::PropertySource;

    #[test]
    fn test_parse_arg() {
        assert_eq!(
            parse_arg("--name=arvin"),
            Some(("name".to_string(), "arvin".to_string()))
        );
        assert_eq!(
            parse_arg("--name="),
            Some(("name".to_string(), String::new()))
        );
        assert_eq!(
            parse_arg("-- key = v "),
            Some(("key".to_string(), "v".to_string()))
        );
        assert_eq!(parse_arg("--a"), None);
        assert_eq!(parse_arg("--=value"), None);
        assert_eq!(parse_arg("name=value"), None);
        assert_eq!(parse_arg("--novalue"), None);
    }

    #[test]
    fn test_command_line_source_with_appended_args() {
        let source = command_line_source(
            ["app", "--env=test", "--set=sg"],
            "  --cluster=asia   --env=prod ",
        );
        assert_eq!(source.name(), COMMAND_LINE_SOURCE_NAME);
        assert_eq!(source.get_property("env"), Some("prod".to_string()));
        assert_eq!(source.get_property("set"), Some("sg".to_string()));
        assert_eq!(source.get_property("cluster"), Some("asia".to_string()));
        assert_eq!(source.get_property("app"), None);
    }

    #[test]
    fn test_command_line_property() {
        let args = ["app", "--env=fat", "--x"];
        assert_eq!(command_line_property(args, "env"), Some("fat".to_string()));
        assert_eq!(command_line_property(args, "x"), None);
        assert_eq!(command_line_property(args, ""), None);
    }
}
