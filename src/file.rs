//! File handle.
//!
//! Opening a file bootstraps the superblock, builds the [`Context`] every
//! decoder shares and, for version 2 and 3 superblocks, reads the
//! superblock extension to pick up the shared message table. Everything
//! else is decoded lazily through the handle.

use crate::attributes::Attributes;
use crate::chunk::ChunkIndex;
use crate::config::Options;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::filter::FilterRegistry;
use crate::io::{is_defined, ByteSource, FileSource};
use crate::links::Group;
use crate::object::messages::{LinkTarget, SharedMessageTableMessage};
use crate::object::ObjectHeader;
use crate::superblock::{DriverInfoBlock, Superblock};
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

/// An open container file.
#[derive(Debug, Clone)]
pub struct File {
    ctx: Context,
    superblock: Superblock,
    extension: Option<Arc<ObjectHeader>>,
}

impl File {
    /// Opens the file at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, Options::default())
    }

    /// Opens the file at `path`.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening {}", path.display());
        Self::from_source(Arc::new(FileSource::open(path)?), options)
    }

    /// Opens a file over any byte source.
    pub fn from_source(source: Arc<dyn ByteSource>, options: Options) -> Result<Self> {
        options.validate()?;
        let superblock = Superblock::bootstrap(source.as_ref(), &options)?;
        let ctx = Context::new(source, superblock.sizes)
            .with_options(options)
            .with_base_address(superblock.base_address);

        let extension = if superblock.has_extension() {
            Some(ObjectHeader::read(&ctx, superblock.extension_address)?)
        } else {
            None
        };
        let table = extension
            .as_ref()
            .and_then(|header| header.get_message::<SharedMessageTableMessage>().cloned());
        if let Some(table) = &table {
            debug!(
                "Shared message table at {:#x} with {} indices",
                table.table_address, table.index_count
            );
        }
        let ctx = ctx.with_shared_message_table(table);
        Ok(Self { ctx, superblock, extension })
    }

    /// Uses `filters` for filtered heap blocks and huge objects.
    pub fn with_filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.ctx = self.ctx.with_filters(filters);
        self
    }

    /// The decoding context of this file.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The decoded superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// The superblock extension header, if the file has one.
    pub fn extension(&self) -> Option<&Arc<ObjectHeader>> {
        self.extension.as_ref()
    }

    /// The driver information block of a version 0 or 1 superblock.
    pub fn driver_info(&self) -> Result<Option<DriverInfoBlock>> {
        self.superblock.driver_info(&self.ctx)
    }

    /// The object header of the root group.
    pub fn open_root(&self) -> Result<Arc<ObjectHeader>> {
        self.object_header(self.superblock.root_address)
    }

    /// The object header at `address`.
    pub fn object_header(&self, address: u64) -> Result<Arc<ObjectHeader>> {
        if !is_defined(address) {
            return Err(Error::format(Structure::ObjectHeader, address, "undefined object address"));
        }
        ObjectHeader::read(&self.ctx, address)
    }

    /// The root group.
    pub fn root_group(&self) -> Result<Group> {
        Group::from_header(&self.ctx, self.open_root()?)
    }

    /// Follows `path` from the root and returns the object's address.
    ///
    /// Components are separated by `/`; soft links are followed, relative
    /// ones from the group holding them.
    pub fn resolve_path(&self, path: &str) -> Result<u64> {
        self.resolve_from(self.superblock.root_address, path, 0)
    }

    fn resolve_from(&self, start: u64, path: &str, hops: usize) -> Result<u64> {
        let mut address = if path.starts_with('/') { self.superblock.root_address } else { start };
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let group = Group::open(&self.ctx, address)?;
            let link = group
                .link(component)?
                .ok_or_else(|| Error::not_found(format!("'{}' in path '{}'", component, path)))?;
            address = match link.target {
                LinkTarget::Hard(target) => target,
                LinkTarget::Soft(target) => {
                    if hops >= self.ctx.options().max_shared_depth {
                        return Err(Error::invalid_argument(format!(
                            "more than {} soft links resolving '{}'",
                            hops, path
                        )));
                    }
                    self.resolve_from(group.address(), &target, hops + 1)?
                }
                LinkTarget::External { file, path } => {
                    return Err(Error::unsupported(
                        Structure::ObjectHeader,
                        group.address(),
                        format!("external link to '{}' in '{}'", path, file),
                    ))
                }
                LinkTarget::UserDefined { link_type, .. } => {
                    return Err(Error::unsupported(
                        Structure::ObjectHeader,
                        group.address(),
                        format!("user-defined link type {}", link_type),
                    ))
                }
            };
        }
        Ok(address)
    }

    /// The object header at `path`.
    pub fn open_path(&self, path: &str) -> Result<Arc<ObjectHeader>> {
        self.object_header(self.resolve_path(path)?)
    }

    /// The group at `path`.
    pub fn group(&self, path: &str) -> Result<Group> {
        Group::from_header(&self.ctx, self.open_path(path)?)
    }

    /// The chunk index of the dataset at `path`.
    pub fn chunk_index(&self, path: &str) -> Result<ChunkIndex> {
        ChunkIndex::for_dataset(&self.ctx, &*self.open_path(path)?)
    }

    /// The attributes of the object at `path`.
    pub fn attributes(&self, path: &str) -> Result<Attributes> {
        Ok(Attributes::new(&self.ctx, self.open_path(path)?))
    }
}
