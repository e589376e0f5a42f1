//! 版本号比较模块
//!
//! 版本号由 `.` 分隔的数字段组成，比较前去掉首尾的非数字字符，如 `v1.2.3-beta` 视为 `1.2.3`。
//! 逐段按数值比较，较短的版本号缺失的段视为 0。

use crate::error::VersionError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 已规范化的版本号
#[derive(Debug, Clone, Eq)]
pub struct Version {
    segments: Vec<u64>,
}

impl Version {
    /// 数字段
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    fn segment(&self, index: usize) -> u64 {
        self.segments.get(index).copied().unwrap_or(0)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::FirstInvalid(s.to_string());
        let trimmed = s
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .trim_end_matches(|c: char| !c.is_ascii_digit());
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let segments = trimmed
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                segment.parse::<u64>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<u64>, VersionError>>()?;
        Ok(Self { segments })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| self.segment(i).cmp(&other.segment(i)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.segments.iter().map(u64::to_string).collect();
        f.write_str(&text.join("."))
    }
}

/// 规范化版本号，不合法时返回 `None`
pub fn normalize(version: &str) -> Option<String> {
    version.parse::<Version>().ok().map(|v| v.to_string())
}

/// 是否合法的版本号
pub fn is_valid(version: &str) -> bool {
    version.parse::<Version>().is_ok()
}

/// 比较两个版本号
///
/// # 返回
/// * `Result<Ordering, VersionError>` - 任一版本号不合法时返回对应的错误
pub fn compare(first: &str, second: &str) -> Result<Ordering, VersionError> {
    match (first.parse::<Version>(), second.parse::<Version>()) {
        (Ok(a), Ok(b)) => Ok(a.cmp(&b)),
        (Err(_), Err(_)) => Err(VersionError::BothInvalid(
            first.to_string(),
            second.to_string(),
        )),
        (Err(_), Ok(_)) => Err(VersionError::FirstInvalid(first.to_string())),
        (Ok(_), Err(_)) => Err(VersionError::SecondInvalid(second.to_string())),
    }
}

/// `first >= second`，版本号不合法时为 false
pub fn first_gte_second(first: &str, second: &str) -> bool {
    compare(first, second).is_ok_and(Ordering::is_ge)
}

/// `first > second`，版本号不合法时为 false
pub fn first_gt_second(first: &str, second: &str) -> bool {
    compare(first, second).is_ok_and(Ordering::is_gt)
}

/// `first <= second`，版本号不合法时为 false
pub fn first_lte_second(first: &str, second: &str) -> bool {
    compare(first, second).is_ok_and(Ordering::is_le)
}

/// `first < second`，版本号不合法时为 false
pub fn first_lt_second(first: &str, second: &str) -> bool {
    compare(first, second).is_ok_and(Ordering::is_lt)
}

/// 判断版本号是否在最小与最大版本之间
///
/// # 参数
/// * `version` - 要检测的版本号
/// * `min` - 最小版本号，空字符串表示不限制
/// * `max` - 最大版本号，空字符串表示不限制
/// * `include_min` - 是否包含最小版本号
/// * `include_max` - 是否包含最大版本号
pub fn between(version: &str, min: &str, max: &str, include_min: bool, include_max: bool) -> bool {
    if !is_valid(version) {
        return false;
    }

    let min_passed = min.is_empty()
        || if include_min {
            first_gte_second(version, min)
        } else {
            first_gt_second(version, min)
        };
    if !min_passed {
        return false;
    }

    max.is_empty()
        || if include_max {
            first_lte_second(version, max)
        } else {
            first_lt_second(version, max)
        }
}

/// 版本范围
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionRange {
    /// 最小版本号
    pub min: String,
    /// 最大版本号
    pub max: String,
    /// 排除的版本号
    pub excludes: Vec<String>,
}

impl VersionRange {
    /// 创建版本范围
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            excludes: Vec::new(),
        }
    }

    /// 添加排除的版本号
    pub fn exclude(mut self, version: impl Into<String>) -> Self {
        self.excludes.push(version.into());
        self
    }
}

/// 判断版本号是否在范围内，命中排除列表时不在范围内
pub fn in_range(version: &str, range: &VersionRange, include_min: bool, include_max: bool) -> bool {
    let Ok(parsed) = version.parse::<Version>() else {
        return false;
    };
    let excluded = range
        .excludes
        .iter()
        .filter_map(|exclude| exclude.parse::<Version>().ok())
        .any(|exclude| exclude == parsed);
    if excluded {
        return false;
    }
    between(version, &range.min, &range.max, include_min, include_max)
}

/// 各平台的版本限制，key 为平台代码
pub type VersionLimit = HashMap<String, VersionRange>;

/// 解析 JSON 格式的版本限制配置
pub fn parse_version_limit(config: &str) -> Result<VersionLimit, VersionError> {
    serde_json::from_str(config).map_err(|e| VersionError::Limit(e.to_string()))
}

/// 判断客户端版本是否被平台接受
///
/// 限制配置或客户端版本为空时接受；平台没有配置限制时接受；
/// 配置不是合法 JSON 时拒绝；否则按闭区间判断是否在范围内。
pub fn accept_platform_version(platform: &str, client_version: &str, limit_config: &str) -> bool {
    if limit_config.is_empty() || client_version.is_empty() {
        return true;
    }
    match parse_version_limit(limit_config) {
        Ok(limit) => limit
            .get(platform)
            .is_none_or(|range| in_range(client_version, range, true, true)),
        Err(e) => {
            tracing::warn!("{}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare() {
        assert_eq!(compare("1.0.0", "1.0.0"), Ok(Ordering::Equal));
        assert_eq!(compare("1.1.0", "1.0.0"), Ok(Ordering::Greater));
        assert_eq!(compare("1.1.0", "2.0.0"), Ok(Ordering::Less));
        assert_eq!(compare("1.10", "1.9"), Ok(Ordering::Greater));
        assert_eq!(compare("1.0", "1.0.0"), Ok(Ordering::Equal));
        assert_eq!(compare("1.0", "1.0.1"), Ok(Ordering::Less));
        assert_eq!(compare("v2.3.1-beta", "2.3.1"), Ok(Ordering::Equal));

        assert!(matches!(compare("1.d1.0", "2.d0.0"), Err(VersionError::BothInvalid(..))));
        assert!(matches!(compare("1.1d.0", "2.0.0"), Err(VersionError::FirstInvalid(_))));
        assert!(matches!(compare("1.1.0", "2.d0.0"), Err(VersionError::SecondInvalid(_))));
        assert!(matches!(
            compare("99999999999999999999999.1", "1"),
            Err(VersionError::FirstInvalid(_))
        ));
    }

    #[test]
    fn test_relations() {
        assert!(first_gt_second("1.0.1", "1.0.0"));
        assert!(!first_gt_second("1.0.0", "1.0.0"));
        assert!(first_gte_second("1.0.0", "1.0.0"));
        assert!(first_lt_second("0.9", "1.0"));
        assert!(first_lte_second("1.0", "1.0"));
        assert!(!first_lt_second("x", "1.0"));
        assert_eq!(normalize("ver-3.02.1_rc"), Some("3.2.1".to_string()));
        assert!(!is_valid("abc"));
    }

    #[test]
    fn test_between() {
        assert!(between("1.0.5", "", "", true, true));
        assert!(between("1.0.5", "", "1.0.8", true, true));
        assert!(between("0.0.5", "", "0.0.8", true, true));
        assert!(between("0.0.5", "0.0.1", "0.0.8", true, true));
        assert!(!between("0.0.1", "0.0.1", "0.0.8", false, false));
        assert!(between("0.0.1", "0.0.1", "0.0.8", true, false));
        assert!(!between("0.0.5", "bad", "", true, true));
    }

    #[test]
    fn test_in_range() {
        assert!(in_range("0.0.1", &VersionRange::new("", ""), false, false));
        assert!(in_range("0.0.1", &VersionRange::new("", "1.0.0"), false, false));
        assert!(!in_range("0.0.1", &VersionRange::new("", "0.0.1"), false, false));
        assert!(!in_range("1.0.0", &VersionRange::new("11.0.0", "1000.0.1"), true, true));
        assert!(!in_range(
            "0.0.1",
            &VersionRange::new("", "").exclude("0.0.1"),
            false,
            false
        ));
    }

    #[test]
    fn test_accept_platform_version() {
        let config = r#"{"ios":{"min":"2.0.0","max":"3.0.0","excludes":["2.5.0"]},"android":{"min":"1.0"}}"#;
        assert!(accept_platform_version("ios", "2.1.0", config));
        assert!(!accept_platform_version("ios", "2.5.0", config));
        assert!(!accept_platform_version("ios", "3.0.1", config));
        assert!(accept_platform_version("android", "9.9", config));
        assert!(accept_platform_version("web", "0.1", config));
        assert!(accept_platform_version("ios", "", config));
        assert!(accept_platform_version("ios", "1.0", ""));
        assert!(!accept_platform_version("ios", "2.1.0", "{not json"));
    }
}
