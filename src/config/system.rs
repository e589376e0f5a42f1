//! 系统环境变量配置源

use crate::config::source::MapPropertySource;
use std::collections::HashMap;

/// 系统环境变量配置源名称
pub const SYSTEM_ENVIRONMENT_SOURCE_NAME: &str = "systemEnvironment";

/// 读取当前进程的环境变量，key 与 value 去除首尾空白
pub fn system_properties() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| {
            let key = key.into_string().ok()?;
            let value = value.into_string().ok()?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// 创建系统环境变量配置源
pub fn system_environment_source() -> MapPropertySource {
    MapPropertySource::new(SYSTEM_ENVIRONMENT_SOURCE_NAME, system_properties())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::PropertySource;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_system_environment_source() {
        std::env::set_var("ENVKIT_SYSTEM_TEST", " a=b ");
        let source = system_environment_source();
        std::env::remove_var("ENVKIT_SYSTEM_TEST");

        assert_eq!(source.name(), SYSTEM_ENVIRONMENT_SOURCE_NAME);
        assert_eq!(
            source.get_property("ENVKIT_SYSTEM_TEST"),
            Some("a=b".to_string())
        );
    }
}
