use crate::{
    block::BlockDevice,
    fat::{FatError, FileHandle, OpenMode, Volume},
    path::{
        next_component, walk_path, Exists, HandlePair, MakeDirs, PathPolicy, RemoveDir, RemoveFile,
    },
};

/// A mounted volume plus its open root directory. Paths are absolute or
/// relative to the root; both mean the same thing.
pub struct SdFs<D: BlockDevice> {
    volume: Volume<D>,
    root: FileHandle,
}

impl<D: BlockDevice> SdFs<D> {
    /// Mounts `device` and opens the root directory.
    pub fn begin(device: D) -> Result<Self, FatError<D::Error>> {
        let mut volume = Volume::init(device)?;
        let mut root = FileHandle::new();
        root.open_root(&mut volume)?;
        Ok(Self { volume, root })
    }

    /// Closes the root, flushes and hands the device back.
    pub fn end(mut self) -> Result<D, FatError<D::Error>> {
        self.root.close(&mut self.volume)?;
        self.volume.release()
    }

    pub fn volume(&mut self) -> &mut Volume<D> {
        &mut self.volume
    }

    pub fn root(&mut self) -> &mut FileHandle {
        &mut self.root
    }

    /// Volume and root together, for calls that need both.
    pub fn parts(&mut self) -> (&mut Volume<D>, &mut FileHandle) {
        (&mut self.volume, &mut self.root)
    }

    /// Opens `path`. The empty path and `/` open the root directory. With
    /// WRITE and APPEND the cursor starts at the end of file.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FatError<D::Error>> {
        let mut pair = HandlePair::new();
        let mut cursor = 0;
        loop {
            let (component, next, more) = next_component(path, cursor);
            cursor = next;

            if !more {
                let mut file = FileHandle::new();
                let opened = if component.is_empty() {
                    file.open_root(&mut self.volume)
                } else {
                    file.open(
                        &mut self.volume,
                        pair.parent(&mut self.root),
                        &component,
                        mode,
                    )
                };
                pair.release(&mut self.volume)?;
                opened?;
                if mode.contains(OpenMode::WRITE | OpenMode::APPEND) {
                    file.seek_end(&mut self.volume)?;
                }
                return Ok(file);
            }

            if !pair.descend(&mut self.volume, &mut self.root, &component)? {
                pair.release(&mut self.volume)?;
                return Err(FatError::NotFound);
            }
        }
    }

    pub fn exists(&mut self, path: &str) -> Result<bool, FatError<D::Error>> {
        if path.is_empty() || path == "/" {
            return Ok(true);
        }
        walk_path(&mut self.volume, &mut self.root, path, &mut Exists)
    }

    /// Creates `path` and any missing parent directories.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FatError<D::Error>> {
        self.walk(path, &mut MakeDirs)
    }

    /// Deletes the file at `path`. Directories are refused with
    /// [`FatError::IsADirectory`].
    pub fn remove(&mut self, path: &str) -> Result<(), FatError<D::Error>> {
        self.walk(path, &mut RemoveFile)
    }

    /// Deletes the empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FatError<D::Error>> {
        self.walk(path, &mut RemoveDir)
    }

    fn walk<P>(&mut self, path: &str, policy: &mut P) -> Result<(), FatError<D::Error>>
    where
        P: PathPolicy<D>,
    {
        if walk_path(&mut self.volume, &mut self.root, path, policy)? {
            Ok(())
        } else {
            Err(FatError::NotFound)
        }
    }
}
