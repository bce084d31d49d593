use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;
use parking_lot::Mutex;

use crate::{
    error::SmallError,
    io::{read_into, SmallWriter},
    types::SmallResult,
};

const FILE_MAGIC: &[u8; 4] = b"SJEL";
const FILE_VERSION: u32 = 1;

/// # Format
///
/// - 4 bytes: magic
/// - 4 bytes: file number
/// - 8 bytes: offset of the last entry in the previous file (0 if none)
/// - 4 bytes: version
/// - 4 bytes: crc32 of the bytes above
pub const FILE_HEADER_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_number: u32,
    pub last_entry_in_prev_file: u64,
    pub version: u32,
}

impl FileHeader {
    fn serialize(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new_reserved(FILE_HEADER_SIZE as usize);
        writer.write_bytes(FILE_MAGIC);
        writer.write(&self.file_number);
        writer.write(&self.last_entry_in_prev_file);
        writer.write(&self.version);
        let mut bytes = writer.into_bytes();
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn deserialize(bytes: &[u8]) -> SmallResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(SmallError::LogFormat(format!(
                "short file header: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != FILE_MAGIC {
            return Err(SmallError::LogFormat("bad file magic".to_string()));
        }
        let mut r = Cursor::new(&bytes[4..FILE_HEADER_SIZE as usize]);
        let header = Self {
            file_number: read_into(&mut r)?,
            last_entry_in_prev_file: read_into(&mut r)?,
            version: read_into(&mut r)?,
        };
        let crc: u32 = read_into(&mut r)?;
        if crc32fast::hash(&bytes[0..20]) != crc {
            return Err(SmallError::LogFormat("file header checksum mismatch".to_string()));
        }
        Ok(header)
    }
}

/// A log file opened with read and write mode.
pub struct LogFile {
    file: File,
    path: PathBuf,
}

impl LogFile {
    fn open(path: &Path, create: bool) -> SmallResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| SmallError::log_io(&format!("open {}", path.display()), e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> SmallResult {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| SmallError::log_io(&format!("write {}", self.path.display()), e))
    }

    /// Read up to `len` bytes, fewer if the file ends first.
    pub fn read_at(&mut self, offset: u64, len: usize) -> SmallResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| (&mut self.file).take(len as u64).read_to_end(&mut buf))
            .map_err(|e| SmallError::log_io(&format!("read {}", self.path.display()), e))?;
        Ok(buf)
    }

    pub fn sync(&self) -> SmallResult {
        self.file
            .sync_data()
            .map_err(|e| SmallError::log_io(&format!("fsync {}", self.path.display()), e))
    }

    pub fn len(&self) -> SmallResult<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| SmallError::log_io(&format!("stat {}", self.path.display()), e))?;
        Ok(metadata.len())
    }

    pub fn set_len(&self, len: u64) -> SmallResult {
        self.file
            .set_len(len)
            .map_err(|e| SmallError::log_io(&format!("truncate {}", self.path.display()), e))
    }
}

/// Names, creates and opens the `NNNNNNNN.jdb` files of a log.
pub struct FileManager {
    home: PathBuf,

    // read handles, the write handle lives in the log manager
    readers: Mutex<HashMap<u32, Arc<Mutex<LogFile>>>>,
}

impl FileManager {
    pub fn new<P: AsRef<Path>>(home: P) -> SmallResult<Self> {
        let home = home.as_ref().to_path_buf();
        fs::create_dir_all(&home)
            .map_err(|e| SmallError::log_io(&format!("create {}", home.display()), e))?;
        Ok(Self {
            home,
            readers: Mutex::new(HashMap::new()),
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn file_name(file_number: u32) -> String {
        format!("{:08x}.jdb", file_number)
    }

    pub fn file_path(&self, file_number: u32) -> PathBuf {
        self.home.join(Self::file_name(file_number))
    }

    /// Numbers of all log files in the home directory, ascending.
    pub fn list_files(&self) -> SmallResult<Vec<u32>> {
        let dir = fs::read_dir(&self.home)
            .map_err(|e| SmallError::log_io(&format!("list {}", self.home.display()), e))?;

        let mut numbers = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| SmallError::log_io("list log files", e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jdb") {
                if stem.len() == 8 {
                    if let Ok(n) = u32::from_str_radix(stem, 16) {
                        numbers.push(n);
                    }
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Create a file and write its header. Returns the write handle.
    pub fn create_file(&self, file_number: u32, last_entry_in_prev_file: u64) -> SmallResult<LogFile> {
        let path = self.file_path(file_number);
        let mut file = LogFile::open(&path, true)?;
        file.set_len(0)?;
        let header = FileHeader {
            file_number,
            last_entry_in_prev_file,
            version: FILE_VERSION,
        };
        file.write_at(0, &header.serialize())?;
        file.sync()?;
        self.readers.lock().remove(&file_number);
        info!("created log file {}", path.display());
        Ok(file)
    }

    pub fn open_for_write(&self, file_number: u32) -> SmallResult<LogFile> {
        LogFile::open(&self.file_path(file_number), false)
    }

    pub fn delete_file(&self, file_number: u32) -> SmallResult {
        self.readers.lock().remove(&file_number);
        let path = self.file_path(file_number);
        fs::remove_file(&path)
            .map_err(|e| SmallError::log_io(&format!("remove {}", path.display()), e))
    }

    fn reader(&self, file_number: u32) -> SmallResult<Arc<Mutex<LogFile>>> {
        let mut readers = self.readers.lock();
        if let Some(r) = readers.get(&file_number) {
            return Ok(r.clone());
        }
        let file = Arc::new(Mutex::new(LogFile::open(&self.file_path(file_number), false)?));
        readers.insert(file_number, file.clone());
        Ok(file)
    }

    pub fn read_at(&self, file_number: u32, offset: u64, len: usize) -> SmallResult<Vec<u8>> {
        let reader = self.reader(file_number)?;
        let mut file = reader.lock();
        file.read_at(offset, len)
    }

    pub fn file_len(&self, file_number: u32) -> SmallResult<u64> {
        let reader = self.reader(file_number)?;
        let file = reader.lock();
        file.len()
    }

    pub fn read_header(&self, file_number: u32) -> SmallResult<FileHeader> {
        let bytes = self.read_at(file_number, 0, FILE_HEADER_SIZE as usize)?;
        let header = FileHeader::deserialize(&bytes)?;
        if header.file_number != file_number {
            return Err(SmallError::LogFormat(format!(
                "file {} claims to be file {}",
                Self::file_name(file_number),
                header.file_number
            )));
        }
        Ok(header)
    }

    pub fn clear_readers(&self) {
        self.readers.lock().clear();
    }
}
