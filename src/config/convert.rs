//! 配置值类型转换
//!
//! 字符串配置值到具体类型的转换，以及跨类型传递配置值时使用的 [`PropertyValue`]。

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::time::Duration;

/// 可由配置字符串转换得到的类型
///
/// 空字符串转换为类型的零值。
pub trait FromProperty: Sized {
    /// 从配置字符串转换
    fn from_property(value: &str) -> Result<Self, ConvertError>;

    /// 类型名称，用于错误信息
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl FromProperty for String {
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        Ok(value.to_string())
    }
}

impl FromProperty for PathBuf {
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        Ok(PathBuf::from(value.trim()))
    }
}

impl FromProperty for Duration {
    /// 纯数字按秒计，否则按 `1h30m`、`500ms`、`1.5s` 这类带单位的写法解析，
    /// 支持 `ns`/`us`/`ms`/`s`/`m`/`h`/`d`
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(Duration::ZERO);
        }
        if let Ok(seconds) = trimmed.parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }
        let nanos = parse_duration_nanos(trimmed)
            .filter(|nanos| nanos.is_finite() && *nanos < u64::MAX as f64)
            .ok_or_else(|| ConvertError::new("Duration", value, "不是合法的时长"))?;
        Ok(Duration::from_nanos(nanos.round() as u64))
    }
}

fn parse_duration_nanos(text: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "d" => 86400e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }
    Some(total)
}

const TRUE_VALUES: [&str; 6] = ["yes", "true", "1", "ok", "on", "open"];
const FALSE_VALUES: [&str; 4] = ["no", "false", "0", "close"];

impl FromProperty for bool {
    /// `yes|true|1|ok|on|open` 为 true，`no|false|0|close` 为 false，忽略大小写
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        let normalized = value.trim().to_lowercase();
        if normalized.is_empty() || FALSE_VALUES.contains(&normalized.as_str()) {
            Ok(false)
        } else if TRUE_VALUES.contains(&normalized.as_str()) {
            Ok(true)
        } else {
            Err(ConvertError::new("bool", value, "不是合法的布尔值"))
        }
    }
}

macro_rules! impl_from_property_for_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromProperty for $ty {
                fn from_property(value: &str) -> Result<Self, ConvertError> {
                    let trimmed = value.trim();
                    if trimmed.is_empty() {
                        return Ok(<$ty>::default());
                    }
                    trimmed
                        .parse::<$ty>()
                        .map_err(|e| ConvertError::new(stringify!($ty), value, e))
                }
            }
        )*
    };
}

impl_from_property_for_number!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl<T: FromProperty> FromProperty for Option<T> {
    /// 空字符串为 `None`
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        if value.trim().is_empty() {
            Ok(None)
        } else {
            T::from_property(value).map(Some)
        }
    }
}

impl<T: FromProperty> FromProperty for Vec<T> {
    /// 以 `[` 开头时按 JSON 数组解析，否则按英文逗号切分并去除首尾空白
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        split_array(value)
            .map_err(|reason| ConvertError::new("array", value, reason))?
            .iter()
            .map(|item| T::from_property(item))
            .collect()
    }
}

/// 将配置值拆分为字符串数组
pub fn split_array(value: &str) -> Result<Vec<String>, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let items: Vec<serde_json::Value> =
            serde_json::from_str(trimmed).map_err(|e| format!("JSON数组解析失败: {e}"))?;
        return Ok(items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect());
    }

    Ok(trimmed.split(',').map(|item| item.trim().to_string()).collect())
}

/// 可作为 map 绑定 key 的类型
pub trait MapKey: FromProperty + Eq + Hash + Clone + Send + Sync + 'static {}

impl MapKey for String {}
impl MapKey for i8 {}
impl MapKey for i16 {}
impl MapKey for i32 {}
impl MapKey for i64 {}
impl MapKey for isize {}
impl MapKey for u8 {}
impl MapKey for u16 {}
impl MapKey for u32 {}
impl MapKey for u64 {}
impl MapKey for usize {}

/// 配置值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// 布尔
    Bool(bool),
    /// 有符号整数
    Int(i64),
    /// 超出 i64 范围的无符号整数
    UInt(u64),
    /// 浮点数
    Float(f64),
    /// 字符串数组
    StringArray(Vec<String>),
    /// 字符串
    String(String),
}

impl PropertyValue {
    /// 根据字面量推断配置值的类型
    ///
    /// `true`/`false` 为布尔，整数与浮点按数值解析，JSON 字符串数组为数组，其余为字符串。
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return PropertyValue::Bool(true),
            "false" => return PropertyValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return PropertyValue::Int(i);
        }
        if let Ok(u) = trimmed.parse::<u64>() {
            return PropertyValue::UInt(u);
        }
        if trimmed.contains(['.', 'e', 'E']) {
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.is_finite() {
                    return PropertyValue::Float(f);
                }
            }
        }
        if trimmed.starts_with('[') {
            if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
                return PropertyValue::StringArray(items);
            }
        }
        PropertyValue::String(raw.to_string())
    }

    /// 类型名称
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::UInt(_) => "uint",
            PropertyValue::Float(_) => "float",
            PropertyValue::StringArray(_) => "string_array",
            PropertyValue::String(_) => "string",
        }
    }

    /// 转换为目标类型
    pub fn convert<T: FromProperty>(&self) -> Result<T, ConvertError> {
        T::from_property(&self.to_string())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::UInt(u) => write!(f, "{u}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::StringArray(items) => {
                let json = serde_json::to_string(items).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl FromProperty for PropertyValue {
    fn from_property(value: &str) -> Result<Self, ConvertError> {
        Ok(PropertyValue::infer(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(PropertyValue::Int)
            .unwrap_or(PropertyValue::UInt(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::StringArray(value)
    }
}

/// 将配置值表转为字符串表，可用于构造配置源
pub fn to_string_map<K, V>(values: HashMap<K, V>) -> HashMap<String, String>
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    values
        .into_iter()
        .map(|(k, v)| (k.into(), v.into().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_conversion() {
        for value in ["yes", "TRUE", "1", "ok", "On", "open"] {
            assert!(bool::from_property(value).unwrap(), "{value}");
        }
        for value in ["no", "false", "0", "close", ""] {
            assert!(!bool::from_property(value).unwrap(), "{value}");
        }
        assert!(bool::from_property("maybe").is_err());
    }

    #[test]
    fn test_number_conversion() {
        assert_eq!(i32::from_property(" 42 ").unwrap(), 42);
        assert_eq!(u16::from_property("").unwrap(), 0);
        assert_eq!(f64::from_property("1.5").unwrap(), 1.5);

        let err = i32::from_property("abc").unwrap_err();
        assert_eq!(err.type_name, "i32");
        assert_eq!(err.value, "abc");
    }

    #[test]
    fn test_array_conversion() {
        assert_eq!(
            Vec::<String>::from_property(r#"["a", "b,c"]"#).unwrap(),
            vec!["a".to_string(), "b,c".to_string()]
        );
        assert_eq!(Vec::<i64>::from_property("1, 2 ,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(Vec::<i64>::from_property("[4,5]").unwrap(), vec![4, 5]);
        assert!(Vec::<i64>::from_property("").unwrap().is_empty());
        assert!(Vec::<i64>::from_property("[1,").is_err());
        assert!(Vec::<i64>::from_property("1,x").is_err());
    }

    #[test]
    fn test_duration_conversion() {
        assert_eq!(Duration::from_property("30").unwrap(), Duration::from_secs(30));
        assert_eq!(Duration::from_property("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(Duration::from_property("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(Duration::from_property("").unwrap(), Duration::ZERO);
        assert!(Duration::from_property("10x").is_err());
        assert!(Duration::from_property("m").is_err());
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Option::<i32>::from_property("").unwrap(), None);
        assert_eq!(Option::<i32>::from_property("7").unwrap(), Some(7));
    }

    #[test]
    fn test_property_value_inference() {
        assert_eq!(PropertyValue::infer("true"), PropertyValue::Bool(true));
        assert_eq!(PropertyValue::infer("-3"), PropertyValue::Int(-3));
        assert_eq!(
            PropertyValue::infer("18446744073709551615"),
            PropertyValue::UInt(u64::MAX)
        );
        assert_eq!(PropertyValue::infer("2.5"), PropertyValue::Float(2.5));
        assert_eq!(
            PropertyValue::infer(r#"["a","b"]"#),
            PropertyValue::StringArray(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            PropertyValue::infer("hello"),
            PropertyValue::String("hello".into())
        );
        assert_eq!(PropertyValue::infer("inf").kind(), "string");
    }

    #[test]
    fn test_property_value_round_trip_through_conversion() {
        let value = PropertyValue::from(vec!["x".to_string(), "y".to_string()]);
        assert_eq!(value.to_string(), r#"["x","y"]"#);
        assert_eq!(value.convert::<Vec<String>>().unwrap(), vec!["x", "y"]);

        let properties = to_string_map(HashMap::from([
            ("port", PropertyValue::from(8080i64)),
            ("debug", PropertyValue::from(true)),
        ]));
        assert_eq!(properties["port"], "8080");
        assert_eq!(properties["debug"], "true");
    }
}
