//! Ordered stack of stream layers with role bookkeeping.

use crate::bigint::Bigint;
use crate::error::Error;
use crate::error::Result;
use crate::stream::Mode;
use crate::stream::SkipDirection;
use crate::stream::Stream;

/// Role a layer plays in the stack, used to query the stack shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LayerRole {
    /// Bottom: slice files, single slice or remote channel.
    Level1,
    /// Above the cipher: data here is not ciphered anymore.
    Uncyphered,
    /// Above the escape layer: data here is payload, marks stripped.
    Clear,
    /// Above the compression layer: plain application data.
    Uncompressed,
    /// Buffering layer.
    Cache,
    /// Worker-offloaded layer.
    Thread,
}

/// Owning composition of layers. Each pushed layer wraps the previous
/// top; application I/O goes through the top and tear-down cascades from
/// the top to the bottom.
pub struct Pile {
    top: Option<Box<dyn Stream>>,
    roles: Vec<LayerRole>,
}

impl Pile {
    /// Starts a stack from its bottom layer.
    pub fn new(bottom: Box<dyn Stream>, role: LayerRole) -> Self {
        Self {
            top: Some(bottom),
            roles: vec![role],
        }
    }

    /// Wraps the current top into a new layer built by `build`.
    pub fn push<F>(&mut self, role: LayerRole, build: F) -> Result<()>
    where
        F: FnOnce(Box<dyn Stream>) -> Result<Box<dyn Stream>>,
    {
        let below = self
            .top
            .take()
            .ok_or_else(|| Error::bug("pushing on a dismantled pile"))?;
        self.top = Some(build(below)?);
        self.roles.push(role);
        Ok(())
    }

    /// Tells whether a layer with the given role is part of the stack.
    pub fn has_role(&self, role: LayerRole) -> bool {
        self.roles.contains(&role)
    }

    /// Role of the topmost layer, scanning from the top, that belongs to
    /// the given set. Mirrors a find-first-from-top lookup.
    pub fn first_role_of(&self, set: &[LayerRole]) -> Option<LayerRole> {
        self.roles.iter().rev().find(|r| set.contains(r)).copied()
    }

    /// Borrows the top of the stack.
    pub fn top(&mut self) -> Result<&mut dyn Stream> {
        match &mut self.top {
            Some(t) => Ok(t.as_mut()),
            None => Err(Error::bug("dismantled pile")),
        }
    }

    /// Consumes the pile, returning the whole stack as its top layer.
    pub fn into_top(mut self) -> Result<Box<dyn Stream>> {
        self.top
            .take()
            .ok_or_else(|| Error::bug("dismantled pile"))
    }
}

impl Stream for Pile {
    fn mode(&self) -> Mode {
        match &self.top {
            Some(t) => t.mode(),
            None => Mode::Read,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.top()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.top()?.write(buf)
    }

    fn skip(&mut self, pos: &Bigint) -> Result<bool> {
        self.top()?.skip(pos)
    }

    fn skip_relative(&mut self, delta: i64) -> Result<bool> {
        self.top()?.skip_relative(delta)
    }

    fn skip_to_eof(&mut self) -> Result<bool> {
        self.top()?.skip_to_eof()
    }

    fn position(&self) -> Result<Bigint> {
        match &self.top {
            Some(t) => t.position(),
            None => Err(Error::bug("dismantled pile")),
        }
    }

    fn skippable(&self, direction: SkipDirection, amount: &Bigint) -> bool {
        match &self.top {
            Some(t) => t.skippable(direction, amount),
            None => false,
        }
    }

    fn read_ahead(&mut self, amount: &Bigint) -> Result<()> {
        self.top()?.read_ahead(amount)
    }

    fn sync_write(&mut self) -> Result<()> {
        self.top()?.sync_write()
    }

    fn flush_read(&mut self) -> Result<()> {
        self.top()?.flush_read()
    }

    fn terminate(&mut self) -> Result<()> {
        match &mut self.top {
            Some(t) => t.terminate(),
            None => Ok(()),
        }
    }

    fn is_terminated(&self) -> bool {
        match &self.top {
            Some(t) => t.is_terminated(),
            None => true,
        }
    }

    fn add_escape_mark(
        &mut self,
        kind: crate::escape::MarkKind,
        unjumpable: bool,
    ) -> Result<()> {
        self.top()?.add_escape_mark(kind, unjumpable)
    }

    fn next_escape_mark(&mut self) -> Result<Option<crate::escape::MarkKind>> {
        self.top()?.next_escape_mark()
    }

    fn skip_to_escape_mark(&mut self, kind: crate::escape::MarkKind) -> Result<bool> {
        self.top()?.skip_to_escape_mark(kind)
    }

    fn set_raw_mode(&mut self, raw: bool) -> Result<()> {
        self.top()?.set_raw_mode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressStream;
    use crate::compress::CompressionAlgo;
    use crate::stream::cache::CacheStream;
    use crate::stream::memory::MemoryStream;

    #[test]
    fn stacked_layers_compose() {
        let mut pile = Pile::new(Box::new(MemoryStream::new()), LayerRole::Level1);
        pile.push(LayerRole::Cache, |below| {
            Ok(Box::new(CacheStream::new(below, 64)?))
        })
        .unwrap();
        pile.push(LayerRole::Uncompressed, |below| {
            Ok(Box::new(CompressStream::new(
                below,
                CompressionAlgo::Gzip,
                6,
                None,
            )?))
        })
        .unwrap();
        assert!(pile.has_role(LayerRole::Cache));
        assert!(!pile.has_role(LayerRole::Uncyphered));
        assert_eq!(
            pile.first_role_of(&[LayerRole::Cache, LayerRole::Level1]),
            Some(LayerRole::Cache)
        );
        pile.write(b"through the whole stack").unwrap();
        pile.sync_write().unwrap();
        pile.terminate().unwrap();
        assert!(pile.is_terminated());
    }
}
