//! 扫描对象模型
//!
//! - `Object` 是带标签的和类型：文件、注册表值、日志条目、进程、通用数据。
//! - 每个对象都有进程内唯一的 `ObjectId`，证据通过 `ObjectId + FieldSelector` 弱引用字段。
//! - 对象内容由 `content::ContentSource` 单独持有，这里只保留描述信息。
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// 对象标识（弱引用的锚点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// 对象种类（用于规则类型门控）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    File,
    RegistryValue,
    LogEntry,
    Process,
    Generic,
}

/// 字段选择器：`Content` 指对象内容流，其余指对象的文本字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSelector {
    Content,
    Path,
    RegistryKey,
    ValueName,
    ParsedValue,
    Source,
    Message,
    Name,
    Image,
    CommandLine,
    Label,
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Content => "content",
            Self::Path => "path",
            Self::RegistryKey => "registry_key",
            Self::ValueName => "value_name",
            Self::ParsedValue => "parsed_value",
            Self::Source => "source",
            Self::Message => "message",
            Self::Name => "name",
            Self::Image => "image",
            Self::CommandLine => "command_line",
            Self::Label => "label",
        };
        f.write_str(s)
    }
}

/// 字段弱引用：不持有对象，只在对象仍存活于 `ObjectStore` 时可解析
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FieldRef {
    pub object: ObjectId,
    pub field: FieldSelector,
}

impl FieldRef {
    pub fn new(object: ObjectId, field: FieldSelector) -> Self {
        Self { object, field }
    }
}

/// 有序键值对；顺序与重复项都参与偏移计算
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileHashes {
    pub md5: String,
    pub sha256: String,
}

impl FileHashes {
    pub fn compute(data: &[u8]) -> Self {
        Self {
            md5: format!("{:x}", Md5::digest(data)),
            sha256: format!("{:x}", Sha256::digest(data)),
        }
    }

    /// 流式计算，避免把大文件整读进内存
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            md5.update(&buffer[..n]);
            sha256.update(&buffer[..n]);
        }
        Ok(Self { md5: format!("{:x}", md5.finalize()), sha256: format!("{:x}", sha256.finalize()) })
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// 解包来源（对应 unpack_source / unpack_parent 外部变量）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnpackInfo {
    pub method: String,
    pub parent: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Object {
    File {
        path: String,
        magic_header: String,
        hashes: FileHashes,
        size: u64,
        unpack: Option<UnpackInfo>,
    },
    RegistryValue {
        key: String,
        value_name: String,
        parsed_value: String,
    },
    LogEntry {
        source: String,
        message: String,
        fields: Vec<KeyValuePair>,
    },
    Process {
        pid: u32,
        name: String,
        image: String,
        command_line: String,
    },
    Generic {
        label: String,
    },
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::File { .. } => ObjectKind::File,
            Object::RegistryValue { .. } => ObjectKind::RegistryValue,
            Object::LogEntry { .. } => ObjectKind::LogEntry,
            Object::Process { .. } => ObjectKind::Process,
            Object::Generic { .. } => ObjectKind::Generic,
        }
    }

    /// 用于日志与报告的可读名称
    pub fn display_name(&self) -> String {
        match self {
            Object::File { path, .. } => path.clone(),
            Object::RegistryValue { key, value_name, .. } => format!("{key}\\{value_name}"),
            Object::LogEntry { source, .. } => source.clone(),
            Object::Process { pid, name, .. } => format!("{name}[{pid}]"),
            Object::Generic { label } => label.clone(),
        }
    }

    /// 文本字段内容；`Content` 与不属于该种类的字段返回 None
    pub fn text_field(&self, field: FieldSelector) -> Option<&str> {
        match (self, field) {
            (Object::File { path, .. }, FieldSelector::Path) => Some(path),
            (Object::RegistryValue { key, .. }, FieldSelector::RegistryKey) => Some(key),
            (Object::RegistryValue { value_name, .. }, FieldSelector::ValueName) => Some(value_name),
            (Object::RegistryValue { parsed_value, .. }, FieldSelector::ParsedValue) => {
                Some(parsed_value)
            }
            (Object::LogEntry { source, .. }, FieldSelector::Source) => Some(source),
            (Object::LogEntry { message, .. }, FieldSelector::Message) => Some(message),
            (Object::Process { name, .. }, FieldSelector::Name) => Some(name),
            (Object::Process { image, .. }, FieldSelector::Image) => Some(image),
            (Object::Process { command_line, .. }, FieldSelector::CommandLine) => {
                Some(command_line)
            }
            (Object::Generic { label }, FieldSelector::Label) => Some(label),
            _ => None,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            Object::File { hashes, .. } => Some(&hashes.sha256),
            _ => None,
        }
    }

    /// 规则可见的外部变量
    pub fn external_vars(&self) -> ExternalVars {
        match self {
            Object::File { path, magic_header, size, unpack, .. } => {
                let (filepath, filename) = split_path(path);
                let extension = match filename.rfind('.') {
                    Some(i) if i + 1 < filename.len() => filename[i + 1..].to_ascii_lowercase(),
                    _ => String::new(),
                };
                ExternalVars {
                    filepath: filepath.to_string(),
                    filename: filename.to_string(),
                    extension,
                    filetype: magic_header.clone(),
                    filesize: *size,
                    unpack_source: unpack.as_ref().map(|u| u.method.clone()).unwrap_or_default(),
                    unpack_parent: unpack.as_ref().map(|u| u.parent.clone()).unwrap_or_default(),
                }
            }
            _ => ExternalVars::default(),
        }
    }
}

/// 外部变量（文件对象以外均为空）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalVars {
    pub filepath: String,
    pub filename: String,
    pub extension: String,
    pub filetype: String,
    pub filesize: u64,
    pub unpack_source: String,
    pub unpack_parent: String,
}

impl ExternalVars {
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            "filepath" => Some(self.filepath.clone()),
            "filename" => Some(self.filename.clone()),
            "extension" => Some(self.extension.clone()),
            "filetype" => Some(self.filetype.clone()),
            "filesize" => Some(self.filesize.to_string()),
            "unpack_source" => Some(self.unpack_source.clone()),
            "unpack_parent" => Some(self.unpack_parent.clone()),
            _ => None,
        }
    }

    pub fn is_known(name: &str) -> bool {
        Self::default().get(name).is_some()
    }
}

/// 拆分为（目录，文件名）；同时接受 `/` 与 `\` 分隔符
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind(|c| c == '/' || c == '\\') {
        Some(0) => (&path[..1], &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// 根据魔数判断文件类型（只看前若干字节）
pub fn detect_magic(prefix: &[u8]) -> &'static str {
    const TABLE: &[(&[u8], &str)] = &[
        (b"PK\x03\x04", "ZIP"),
        (b"PK\x05\x06", "ZIP"),
        (b"MZ", "EXE"),
        (b"\x7fELF", "ELF"),
        (b"%PDF", "PDF"),
        (b"\x1f\x8b", "GZIP"),
        (b"Rar!\x1a\x07", "RAR"),
        (b"7z\xbc\xaf\x27\x1c", "7Z"),
    ];
    TABLE
        .iter()
        .find(|(magic, _)| prefix.starts_with(magic))
        .map(|(_, name)| *name)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_vars_split_unix_path() {
        let object = Object::File {
            path: "/etc/shadow".into(),
            magic_header: String::new(),
            hashes: FileHashes::default(),
            size: 3,
            unpack: None,
        };
        let vars = object.external_vars();
        assert_eq!(vars.filepath, "/etc");
        assert_eq!(vars.filename, "shadow");
        assert_eq!(vars.extension, "");
    }

    #[test]
    fn external_vars_of_extracted_member() {
        let object = Object::File {
            path: "outer.zip/Payload.EXE".into(),
            magic_header: "EXE".into(),
            hashes: FileHashes::default(),
            size: 2,
            unpack: Some(UnpackInfo { method: "ZIP".into(), parent: "outer.zip".into(), depth: 1 }),
        };
        let vars = object.external_vars();
        assert_eq!(vars.filename, "Payload.EXE");
        assert_eq!(vars.extension, "exe");
        assert_eq!(vars.unpack_source, "ZIP");
        assert_eq!(vars.unpack_parent, "outer.zip");
    }

    #[test]
    fn magic_detection() {
        assert_eq!(detect_magic(b"PK\x03\x04rest"), "ZIP");
        assert_eq!(detect_magic(b"MZ\x90\x00"), "EXE");
        assert_eq!(detect_magic(b"plain text"), "");
        assert_eq!(detect_magic(b""), "");
    }

    #[test]
    fn streaming_hashes_match_one_shot() {
        let data = b"hello world".repeat(10_000);
        let streamed = FileHashes::from_reader(&mut &data[..]).unwrap();
        assert_eq!(streamed, FileHashes::compute(&data));
        assert_eq!(FileHashes::compute(b"").md5, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn text_fields_follow_kind() {
        let object = Object::RegistryValue {
            key: "HKLM\\Run".into(),
            value_name: "updater".into(),
            parsed_value: "c:\\x.exe".into(),
        };
        assert_eq!(object.text_field(FieldSelector::ValueName), Some("updater"));
        assert_eq!(object.text_field(FieldSelector::Path), None);
        assert_eq!(object.kind(), ObjectKind::RegistryValue);
    }
}
