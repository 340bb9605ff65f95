//! XPath 与 JSONPath 选择器，匹配器和提取器共用

use serde_json::Value as JsonValue;
use sxd_xpath::Value as XPathValue;

use crate::{Result, ScanError};

/// 在HTML上求值XPath表达式，返回每个结果的文本值
pub fn xpath_values(html: &str, expression: &str) -> Result<Vec<String>> {
    let package = sxd_html::parse_html(html);
    let document = package.as_document();

    let value = sxd_xpath::evaluate_xpath(&document, expression)
        .map_err(|e| ScanError::Matcher(format!("无效的XPath表达式 {}: {}", expression, e)))?;

    Ok(match value {
        XPathValue::Nodeset(nodes) => nodes
            .document_order()
            .into_iter()
            .map(|node| node.string_value().trim().to_string())
            .collect(),
        XPathValue::Boolean(true) => vec!["true".to_string()],
        XPathValue::Boolean(false) => Vec::new(),
        XPathValue::Number(n) if n.is_nan() => Vec::new(),
        XPathValue::Number(n) => vec![n.to_string()],
        XPathValue::String(s) if s.is_empty() => Vec::new(),
        XPathValue::String(s) => vec![s],
    })
}

/// 评估点分JSONPath（`$.a.b[0]`、`a.b.0`），null 视为不存在
pub fn json_path_values(json_value: &JsonValue, path: &str) -> Vec<JsonValue> {
    let path = path.trim();

    // 处理根路径
    if path == "$" || path.is_empty() {
        return vec![json_value.clone()];
    }

    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    let mut current_values = vec![json_value.clone()];

    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (property, indexes) = split_indexes(part);
        let mut next_values = Vec::new();

        for current in current_values {
            let mut value = if property.is_empty() {
                Some(current)
            } else {
                match current {
                    JsonValue::Object(map) => map.get(property).cloned(),
                    JsonValue::Array(arr) => property.parse::<usize>().ok().and_then(|i| arr.get(i).cloned()),
                    _ => None,
                }
            };

            for index in &indexes {
                value = match value {
                    Some(JsonValue::Array(arr)) => arr.get(*index).cloned(),
                    _ => None,
                };
            }

            if let Some(value) = value {
                if !value.is_null() {
                    next_values.push(value);
                }
            }
        }

        current_values = next_values;
        if current_values.is_empty() {
            break;
        }
    }

    current_values
}

/// 拆分 `items[0][1]` 为属性名和索引列表
fn split_indexes(part: &str) -> (&str, Vec<usize>) {
    let bracket = match part.find('[') {
        Some(pos) => pos,
        None => return (part, Vec::new()),
    };

    let indexes = part[bracket..]
        .split('[')
        .filter_map(|s| s.strip_suffix(']'))
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    (&part[..bracket], indexes)
}

/// 将JSON值转换为字符串
pub fn json_value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => "null".to_string(),
        _ => value.to_string(),
    }
}
