//! 资源 URI 模板：解析为字面量 / 占位符片段，按声明顺序代入参数
//!
//! 参数映射没有顺序保证，所以代入时按占位符名查值，而不是按映射的遍历顺序。
//! 占位符支持 RFC 6570 风格的前缀操作符（`+ # . / ; ? &`）与后缀修饰（`*`、`:N`），只取名字部分。

use serde_json::{json, Map, Value};

/// 模板片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed placeholder in template '{0}'")]
    Unclosed(String),

    #[error("empty placeholder in template '{0}'")]
    EmptyPlaceholder(String),

    #[error("missing argument '{0}'")]
    MissingArgument(String),
}

/// 已解析的 URI 模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    segments: Vec<Segment>,
}

fn placeholder_name(inner: &str) -> &str {
    let name = inner.trim_start_matches(['+', '#', '.', '/', ';', '?', '&']);
    let name = name.split(':').next().unwrap_or(name);
    name.trim_end_matches('*').trim()
}

impl UriTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| TemplateError::Unclosed(raw.to_string()))?;
            let name = placeholder_name(&after[..close]);
            if name.is_empty() {
                return Err(TemplateError::EmptyPlaceholder(raw.to_string()));
            }
            segments.push(Segment::Placeholder(name.to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 占位符名，按声明顺序，去重
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Placeholder(name) = seg {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// 代入参数得到具体 URI；缺参数直接报错，不留空洞
    pub fn expand(&self, arguments: &Map<String, Value>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = arguments
                        .get(name)
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| TemplateError::MissingArgument(name.clone()))?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

/// 描述中的单个占位符提示：`name:description,type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamHint {
    pub name: String,
    pub description: String,
    pub json_type: String,
}

/// 拆分 `正文|name:desc,type;name2:desc2,type2` 形式的描述
pub fn split_param_hints(description: &str) -> (String, Vec<ParamHint>) {
    let Some((text, hints)) = description.split_once('|') else {
        return (description.trim().to_string(), Vec::new());
    };

    let parsed = hints
        .split(';')
        .filter_map(|entry| {
            let (name, rest) = entry.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let (desc, ty) = match rest.rsplit_once(',') {
                Some((d, t)) if !t.trim().is_empty() => (d.trim(), t.trim()),
                _ => (rest.trim(), "string"),
            };
            Some(ParamHint {
                name: name.to_string(),
                description: desc.to_string(),
                json_type: ty.to_string(),
            })
        })
        .collect();

    (text.trim().to_string(), parsed)
}

/// 为模板生成参数 schema：每个占位符一个必填属性，提示覆盖类型与描述
pub fn argument_schema(template: &UriTemplate, hints: &[ParamHint]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for name in template.placeholders() {
        let hint = hints.iter().find(|h| h.name == name);
        let (ty, desc) = match hint {
            Some(h) => (h.json_type.clone(), h.description.clone()),
            None => ("string".to_string(), format!("Value for {{{}}}", name)),
        };
        properties.insert(name.to_string(), json!({ "type": ty, "description": desc }));
        required.push(Value::String(name.to_string()));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
