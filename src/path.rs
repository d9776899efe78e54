//! Slash-separated path traversal with a constant number of open handles.

use heapless::String;

use crate::{
    block::BlockDevice,
    fat::{FatError, FileHandle, OpenMode, Volume},
};

/// Longest component kept by [`next_component`]: 8.3 name plus the dot.
pub const MAX_COMPONENT_LEN: usize = 12;

pub type Component = String<MAX_COMPONENT_LEN>;

/// Splits the component starting at byte `cursor` off `path`.
///
/// Skips one leading `/`, copies up to [`MAX_COMPONENT_LEN`] bytes up to the
/// next `/` or the end (the rest of a longer component is skipped), then
/// skips one trailing `/`. Returns the component, the cursor for the next
/// call and whether anything follows.
pub fn next_component(path: &str, cursor: usize) -> (Component, usize, bool) {
    let bytes = path.as_bytes();
    let mut offset = cursor.min(bytes.len());
    if bytes.get(offset) == Some(&b'/') {
        offset += 1;
    }

    let mut component = Component::new();
    while let Some(&b) = bytes.get(offset) {
        if b == b'/' {
            break;
        }
        if component.len() < MAX_COMPONENT_LEN {
            // Non-ASCII bytes cannot appear in an 8.3 name; keep them out of
            // the buffer so it stays valid UTF-8.
            let c = if b.is_ascii() { b as char } else { '?' };
            let _ = component.push(c);
        }
        offset += 1;
    }

    if bytes.get(offset) == Some(&b'/') {
        offset += 1;
    }
    (component, offset, offset < bytes.len())
}

/// Per-component decision taken while [`walk_path`] descends.
///
/// `parent` is the directory holding `component`. Returning `Ok(false)`
/// stops the walk.
pub trait PathPolicy<D: BlockDevice> {
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        is_last: bool,
    ) -> Result<bool, FatError<D::Error>>;
}

impl<D, F> PathPolicy<D> for F
where
    D: BlockDevice,
    F: FnMut(&mut Volume<D>, &mut FileHandle, &str, bool) -> Result<bool, FatError<D::Error>>,
{
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        is_last: bool,
    ) -> Result<bool, FatError<D::Error>> {
        self(vol, parent, component, is_last)
    }
}

/// The two directory handles used while descending. One holds the current
/// parent, the other receives the next child; they swap roles each level.
/// `parent == None` means the caller's root is the parent.
#[derive(Default)]
pub(crate) struct HandlePair {
    slots: [FileHandle; 2],
    parent: Option<usize>,
}

impl HandlePair {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn parent<'a>(&'a mut self, root: &'a mut FileHandle) -> &'a mut FileHandle {
        match self.parent {
            Some(index) => &mut self.slots[index],
            None => root,
        }
    }

    /// Opens directory `name` under the current parent and makes it the new
    /// parent. `Ok(false)` if it is missing or not a directory.
    pub(crate) fn descend<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
        root: &mut FileHandle,
        name: &str,
    ) -> Result<bool, FatError<D::Error>> {
        let child_index = match self.parent {
            Some(index) => 1 - index,
            None => 0,
        };
        let (parent, child) = match self.parent {
            None => (root, &mut self.slots[0]),
            Some(_) => {
                let (first, second) = self.slots.split_at_mut(1);
                if child_index == 0 {
                    (&mut second[0], &mut first[0])
                } else {
                    (&mut first[0], &mut second[0])
                }
            }
        };

        let opened = child.open(vol, parent, name, OpenMode::READ);
        if self.parent.is_some() {
            parent.close(vol)?;
        }
        self.parent = None;

        match opened {
            Ok(()) if child.is_dir() => {
                self.parent = Some(child_index);
                Ok(true)
            }
            Ok(()) => {
                child.close(vol)?;
                Ok(false)
            }
            Err(FatError::NotFound | FatError::InvalidName) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Closes whichever slot is open.
    pub(crate) fn release<D: BlockDevice>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<(), FatError<D::Error>> {
        self.parent = None;
        for slot in &mut self.slots {
            if slot.is_open() {
                slot.close(vol)?;
            }
        }
        Ok(())
    }
}

/// Walks `path` from `root`, asking `policy` about every component.
///
/// `Ok(true)` once the last component was accepted; `Ok(false)` when the
/// policy stopped the walk or an intermediate directory is missing. Only two
/// handles are open at any depth.
pub fn walk_path<D, P>(
    vol: &mut Volume<D>,
    root: &mut FileHandle,
    path: &str,
    policy: &mut P,
) -> Result<bool, FatError<D::Error>>
where
    D: BlockDevice,
    P: PathPolicy<D> + ?Sized,
{
    let mut pair = HandlePair::new();
    let mut cursor = 0;
    loop {
        let (component, next, more) = next_component(path, cursor);
        cursor = next;

        let decision = policy.decide(vol, pair.parent(root), &component, !more);
        let keep_going = match decision {
            Ok(keep_going) => keep_going,
            Err(err) => {
                let _ = pair.release(vol);
                return Err(err);
            }
        };
        if !keep_going {
            pair.release(vol)?;
            return Ok(false);
        }
        if !more {
            break;
        }
        if !pair.descend(vol, root, &component)? {
            pair.release(vol)?;
            return Ok(false);
        }
    }
    pair.release(vol)?;
    Ok(true)
}

/// Continues only while each component exists.
pub struct Exists;

impl<D: BlockDevice> PathPolicy<D> for Exists {
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        _is_last: bool,
    ) -> Result<bool, FatError<D::Error>> {
        lookup(vol, parent, component).map(|found| found.is_some())
    }
}

/// `mkdir -p`: creates every missing component as a directory.
pub struct MakeDirs;

impl<D: BlockDevice> PathPolicy<D> for MakeDirs {
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        _is_last: bool,
    ) -> Result<bool, FatError<D::Error>> {
        match lookup(vol, parent, component)? {
            Some(true) => Ok(true),
            Some(false) => Err(FatError::NotADirectory),
            None => {
                let mut dir = FileHandle::new();
                dir.make_dir(vol, parent, component)?;
                dir.close(vol)?;
                Ok(true)
            }
        }
    }
}

/// Deletes the final component, which must be a file.
pub struct RemoveFile;

impl<D: BlockDevice> PathPolicy<D> for RemoveFile {
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        is_last: bool,
    ) -> Result<bool, FatError<D::Error>> {
        if is_last {
            FileHandle::remove_path(vol, parent, component)?;
        }
        Ok(true)
    }
}

/// Deletes the final component, which must be an empty directory.
pub struct RemoveDir;

impl<D: BlockDevice> PathPolicy<D> for RemoveDir {
    fn decide(
        &mut self,
        vol: &mut Volume<D>,
        parent: &mut FileHandle,
        component: &str,
        is_last: bool,
    ) -> Result<bool, FatError<D::Error>> {
        if is_last {
            let mut dir = FileHandle::new();
            dir.open(vol, parent, component, OpenMode::READ)?;
            if let Err(err) = dir.rm_dir(vol) {
                let _ = dir.close(vol);
                return Err(err);
            }
        }
        Ok(true)
    }
}

/// Opens and closes `name`. `Some(is_dir)` if it exists.
fn lookup<D: BlockDevice>(
    vol: &mut Volume<D>,
    parent: &mut FileHandle,
    name: &str,
) -> Result<Option<bool>, FatError<D::Error>> {
    let mut child = FileHandle::new();
    match child.open(vol, parent, name, OpenMode::READ) {
        Ok(()) => {
            let is_dir = child.is_dir();
            child.close(vol)?;
            Ok(Some(is_dir))
        }
        Err(FatError::NotFound | FatError::InvalidName) => Ok(None),
        Err(err) => Err(err),
    }
}
