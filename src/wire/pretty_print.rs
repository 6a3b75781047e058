//! Indentation helper for the nested `Display` impls used when tracing
//! packets at `trace` log level (`netf_trace!`-style dumps).

use core::fmt;

pub trait PrettyPrint {
    fn pretty_print(
        buffer: &dyn AsRef<[u8]>,
        f: &mut fmt::Formatter,
        indent: &mut PrettyIndent,
    ) -> fmt::Result;
}

#[derive(Debug, Default)]
pub struct PrettyIndent {
    level: usize,
    printed: bool,
}

impl PrettyIndent {
    pub fn new_level() -> PrettyIndent {
        PrettyIndent {
            level: 0,
            printed: false,
        }
    }

    pub fn increase(&mut self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.printed {
            writeln!(f)?;
        }
        self.level += 1;
        self.printed = false;
        Ok(())
    }
}

impl fmt::Display for PrettyIndent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.printed {
            writeln!(f)?;
        }
        for _ in 0..self.level {
            write!(f, " ")?;
        }
        Ok(())
    }
}

pub struct PrettyPrinter<'a, T: PrettyPrint> {
    buffer: &'a dyn AsRef<[u8]>,
    phantom: core::marker::PhantomData<T>,
}

impl<'a, T: PrettyPrint> PrettyPrinter<'a, T> {
    pub fn new(buffer: &'a dyn AsRef<[u8]>) -> PrettyPrinter<'a, T> {
        PrettyPrinter {
            buffer,
            phantom: core::marker::PhantomData,
        }
    }
}

impl<'a, T: PrettyPrint> fmt::Display for PrettyPrinter<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut indent = PrettyIndent::new_level();
        T::pretty_print(&self.buffer, f, &mut indent)
    }
}
