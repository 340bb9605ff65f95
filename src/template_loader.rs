//! 模板加载
//!
//! 从单个文件或目录树加载检测模板。单个文件解析失败只记录日志并跳过，
//! 不会中断整个批次；识别为 profile 的文件静默跳过。

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::template::{Template, TemplateDocument};
use crate::{Result, ScanError};

/// profile 文档中使用的选择器字段
const PROFILE_KEYS: &[&str] = &["severity", "type", "exclude-id", "exclude-ids", "tags", "exclude-tags"];

/// 一次加载的结果
#[derive(Debug, Default)]
pub struct LoadReport {
    pub templates: Vec<Template>,
    pub profiles_skipped: usize,
    pub failures: Vec<(PathBuf, String)>,
}

/// 判断文件扩展名是否为模板文件
pub fn is_template_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// 判断YAML文档是否为 profile（只有选择器字段，没有请求块）
pub fn is_profile_document(value: &serde_yaml::Value) -> bool {
    let mapping = match value.as_mapping() {
        Some(mapping) => mapping,
        None => return false,
    };

    let has_requests = ["http", "requests", "dns", "network", "tcp", "headless"]
        .iter()
        .any(|key| mapping.contains_key(*key));
    if has_requests {
        return false;
    }

    PROFILE_KEYS.iter().any(|key| {
        mapping
            .get(*key)
            .map(|v| v.is_sequence() || v.is_string())
            .unwrap_or(false)
    })
}

/// 从YAML文本解析模板，`fallback_id` 用在模板未声明ID的情况
pub fn parse_template(content: &str, path: &Path, fallback_id: Option<&str>) -> Result<Template> {
    let value: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| ScanError::TemplateLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if is_profile_document(&value) {
        return Err(ScanError::ProfileFile(path.to_path_buf()));
    }

    let document: TemplateDocument = serde_yaml::from_value(value).map_err(|e| ScanError::TemplateLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Template::from_document(document, fallback_id).map_err(|e| ScanError::TemplateLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// 加载单个模板文件，模板ID为空时使用文件名
pub fn load_template(path: &Path) -> Result<Template> {
    if !is_template_file(path) {
        return Err(ScanError::TemplateLoad {
            path: path.to_path_buf(),
            reason: "not a .yaml/.yml file".to_string(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let stem = path.file_stem().and_then(|s| s.to_str());
    let template = parse_template(&content, path, stem)?;
    debug!("成功加载模板: {} ({})", template.id, path.display());
    Ok(template)
}

/// 从文件或目录加载所有模板
pub fn load_templates(root: &Path) -> Result<LoadReport> {
    if !root.exists() {
        return Err(ScanError::InvalidInput(format!("模板路径不存在: {}", root.display())));
    }

    let mut report = LoadReport::default();

    if root.is_file() {
        record(&mut report, root, load_template(root));
        return Ok(report);
    }

    info!("从目录加载模板: {}", root.display());

    // 递归遍历目录查找.yaml和.yml文件
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_file() && is_template_file(path) {
            record(&mut report, path, load_template(path));
        }
    }

    info!(
        "从目录 {} 成功加载 {} 个模板，跳过 {} 个profile，失败 {} 个",
        root.display(),
        report.templates.len(),
        report.profiles_skipped,
        report.failures.len()
    );
    Ok(report)
}

fn record(report: &mut LoadReport, path: &Path, result: Result<Template>) {
    match result {
        Ok(template) => report.templates.push(template),
        Err(ScanError::ProfileFile(_)) => {
            info!("跳过profile文件: {}", path.display());
            report.profiles_skipped += 1;
        }
        Err(e) => {
            warn!("加载模板文件 {} 失败: {}", path.display(), e);
            report.failures.push((path.to_path_buf(), e.to_string()));
        }
    }
}
