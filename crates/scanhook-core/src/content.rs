//! 对象内容访问（随机读 + 顺序读）
//!
//! `ContentSource` 是底层数据源（内存或文件），`ContentReader` 是带游标的句柄：
//! 多个句柄可以并发读取重叠区间，互不影响游标。
//! 同一对象处理期间发出的句柄共享一个读错误记录，调度器据此判定 ReaderError。
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait ContentSource: Send + Sync {
    fn size(&self) -> u64;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// 内存数据源（解包出的文件、字符串、结构化数据）
pub struct BytesSource {
    data: Vec<u8>,
}

impl BytesSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ContentSource for BytesSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// 文件数据源：按需读取，不整读进内存
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), size })
    }
}

impl ContentSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file handle poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let want = buf.len().min((self.size - offset) as usize);
        let mut filled = 0;
        while filled < want {
            match file.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

type FaultCell = Arc<Mutex<Option<String>>>;

/// 内容句柄
#[derive(Clone)]
pub struct ContentReader {
    source: Arc<dyn ContentSource>,
    pos: u64,
    fault: FaultCell,
}

impl ContentReader {
    pub fn new(source: Arc<dyn ContentSource>) -> Self {
        Self { source, pos: 0, fault: Arc::new(Mutex::new(None)) }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Arc::new(BytesSource::new(data.into())))
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    /// 新句柄：游标归零，与当前句柄共享读错误记录
    pub fn handle(&self) -> ContentReader {
        Self { source: Arc::clone(&self.source), pos: 0, fault: Arc::clone(&self.fault) }
    }

    /// 完全独立的新句柄（后处理使用）
    pub fn reopen(&self) -> ContentReader {
        Self::new(Arc::clone(&self.source))
    }

    /// 该句柄族记录到的首个读错误
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|f| f.clone())
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.source.read_at(buf, offset).map_err(|e| {
            if let Ok(mut slot) = self.fault.lock() {
                if slot.is_none() {
                    *slot = Some(format!("offset={offset} {e}"));
                }
            }
            e
        })
    }

    /// 读取 `[offset, offset+len)`，越过末尾时截断
    pub fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let avail = self.size().saturating_sub(offset).min(len as u64) as usize;
        let mut buf = vec![0u8; avail];
        let mut filled = 0;
        while filled < avail {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ContentReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of content")),
        }
    }
}
