use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use tokio::fs;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::EngineError;

/// How the shared file splits into pieces. Every piece is `piece_size`
/// bytes except the last one, which takes whatever is left.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PieceLayout {
    pub file_size: u64,
    pub piece_size: u64,
}

impl PieceLayout {
    pub fn new(file_size: u64, piece_size: u64) -> PieceLayout {
        PieceLayout { file_size, piece_size }
    }

    pub fn num_pieces(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }

    pub fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.piece_size
    }

    /// Length of `piece`, or 0 past the end of the file.
    pub fn piece_len(&self, piece: usize) -> usize {
        let offset = self.piece_offset(piece);

        if offset >= self.file_size {
            0
        }
        else {
            (self.file_size - offset).min(self.piece_size) as usize
        }
    }
}

/// Byte-range storage for the shared file, addressed by piece index.
#[async_trait]
pub trait PieceStore: Send + Sync {
    fn layout(&self) -> PieceLayout;
    async fn read_piece(&self, piece: usize) -> std::io::Result<Bytes>;
    async fn write_piece(&self, piece: usize, data: &[u8]) -> std::io::Result<()>;
}

/// The shared file on disk. One lock serializes every seek+read/write pair.
pub struct FilePieceStore {
    path: PathBuf,
    layout: PieceLayout,
    /// Seeders never write to their copy of the file.
    read_only: bool,
    file: Mutex<File>,
}

impl FilePieceStore {
    /// Opens the backing file. A seeder's file must already exist; anybody
    /// else gets a fresh file sized to the whole transfer.
    pub async fn open(path: &Path, layout: PieceLayout, has_file: bool) -> Result<FilePieceStore, EngineError> {
        let storage_err = |source| EngineError::Storage { path: path.to_path_buf(), source };

        let file = if has_file {
            File::open(path).await.map_err(storage_err)?
        }
        else {
            FilePieceStore::create_file(path, layout.file_size).await.map_err(storage_err)?
        };

        Ok(FilePieceStore {
            path: path.to_path_buf(),
            layout,
            read_only: has_file,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn create_file(path: &Path, size: u64) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?
        ;

        file.set_len(size).await?;
        Ok(file)
    }
}

#[async_trait]
impl PieceStore for FilePieceStore {
    fn layout(&self) -> PieceLayout {
        self.layout
    }

    async fn read_piece(&self, piece: usize) -> std::io::Result<Bytes> {
        let mut piece_buf = vec![0; self.layout.piece_len(piece)];
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(self.layout.piece_offset(piece))).await?;
        file.read_exact(&mut piece_buf).await?;

        Ok(piece_buf.into())
    }

    async fn write_piece(&self, piece: usize, data: &[u8]) -> std::io::Result<()> {
        if self.read_only {
            return Ok(());
        }

        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(self.layout.piece_offset(piece))).await?;
        file.write_all(data).await?;
        file.flush().await
    }
}

#[cfg(test)]
pub mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Whole file kept in memory.
    pub struct MemoryPieceStore {
        layout: PieceLayout,
        data: Mutex<Vec<u8>>,
    }

    impl MemoryPieceStore {
        pub fn empty(layout: PieceLayout) -> MemoryPieceStore {
            MemoryPieceStore {
                layout,
                data: Mutex::new(vec![0; layout.file_size as usize]),
            }
        }

        pub fn with_data(layout: PieceLayout, data: Vec<u8>) -> MemoryPieceStore {
            assert_eq!(data.len() as u64, layout.file_size);

            MemoryPieceStore { layout, data: Mutex::new(data) }
        }

        pub fn contents(&self) -> Vec<u8> {
            self.data.lock().clone()
        }
    }

    #[async_trait]
    impl PieceStore for MemoryPieceStore {
        fn layout(&self) -> PieceLayout {
            self.layout
        }

        async fn read_piece(&self, piece: usize) -> std::io::Result<Bytes> {
            let start = self.layout.piece_offset(piece) as usize;
            let end = start + self.layout.piece_len(piece);

            Ok(Bytes::copy_from_slice(&self.data.lock()[start..end]))
        }

        async fn write_piece(&self, piece: usize, data: &[u8]) -> std::io::Result<()> {
            let start = self.layout.piece_offset(piece) as usize;
            self.data.lock()[start..start + data.len()].copy_from_slice(data);

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_handles_a_short_last_piece() {
        let layout = PieceLayout::new(10, 4);

        assert_eq!(layout.num_pieces(), 3);
        assert_eq!(layout.piece_len(0), 4);
        assert_eq!(layout.piece_len(2), 2);
        assert_eq!(layout.piece_len(3), 0);
        assert_eq!(PieceLayout::new(8, 4).num_pieces(), 2);
        assert_eq!(PieceLayout::new(0, 4).num_pieces(), 0);
    }

    #[tokio::test]
    async fn writes_and_reads_pieces_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_1002").join("shared.dat");
        let layout = PieceLayout::new(10, 4);

        let store = FilePieceStore::open(&path, layout, false).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        store.write_piece(2, b"yz").await.unwrap();
        store.write_piece(0, b"abcd").await.unwrap();

        assert_eq!(store.read_piece(0).await.unwrap().as_ref(), b"abcd");
        assert_eq!(store.read_piece(1).await.unwrap().as_ref(), &[0; 4]);
        assert_eq!(store.read_piece(2).await.unwrap().as_ref(), b"yz");
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd\0\0\0\0yz");
    }

    #[tokio::test]
    async fn seeder_file_must_exist_and_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.dat");
        let layout = PieceLayout::new(6, 4);

        assert!(matches!(
            FilePieceStore::open(&path, layout, true).await,
            Err(EngineError::Storage { .. })
        ));

        std::fs::write(&path, b"seeded").unwrap();
        let store = FilePieceStore::open(&path, layout, true).await.unwrap();

        store.write_piece(0, b"XXXX").await.unwrap();
        assert_eq!(store.read_piece(0).await.unwrap().as_ref(), b"seed");
        assert_eq!(store.read_piece(1).await.unwrap().as_ref(), b"ed");
    }
}
