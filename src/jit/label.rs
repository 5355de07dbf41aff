use crate::error::ExprError;

/// Handle to a code position that may not be known yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

/// A placeholder rel32 displacement waiting for its label. The displacement
/// is relative to the end of its four bytes.
#[derive(Clone, Copy, Debug)]
struct Link {
    label: Label,
    /// Offset of the four displacement bytes in the code.
    at: usize,
    addend: i32,
}

/// Arena of labels and back-references for one compile.
///
/// Positions are code offsets and every link is relative, so the resolved
/// bytes do not depend on where the buffer ends up.
#[derive(Clone, Debug, Default)]
pub struct Labels {
    bound: Vec<Option<usize>>,
    links: Vec<Link>,
}

impl Labels {
    pub fn new_label(&mut self) -> Label {
        self.bound.push(None);
        Label(self.bound.len() as u32 - 1)
    }

    pub fn bind(&mut self, label: Label, offset: usize) {
        if let Some(slot) = self.bound.get_mut(label.0 as usize) {
            *slot = Some(offset);
        }
    }

    pub fn link(&mut self, label: Label, at: usize, addend: i32) {
        self.links.push(Link { label, at, addend });
    }

    pub fn pending(&self) -> usize {
        self.links.len()
    }

    /// Computes every linked displacement and hands each one to `patch` with
    /// its offset.
    pub fn resolve<F>(&self, mut patch: F) -> Result<(), ExprError>
    where
        F: FnMut(usize, [u8; 4]),
    {
        for link in &self.links {
            let target = self
                .bound
                .get(link.label.0 as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    ExprError::CodeGen(format!("label {} was never bound", link.label.0))
                })?;
            let rel = target as i64 - (link.at as i64 + 4) + link.addend as i64;
            let value = i32::try_from(rel)
                .map_err(|_| ExprError::CodeGen("relative displacement overflow".into()))?;
            patch(link.at, value.to_le_bytes());
        }
        Ok(())
    }

    /// Forgets all labels and links.
    pub fn reset(&mut self) {
        self.bound.clear();
        self.links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(labels: &Labels, code: &mut [u8]) -> Result<(), ExprError> {
        labels.resolve(|at, bytes| code[at..at + 4].copy_from_slice(&bytes))
    }

    #[test]
    fn links_resolve_relative_to_their_end() {
        let mut labels = Labels::default();
        let l = labels.new_label();
        labels.link(l, 2, 8);
        labels.bind(l, 16);
        let mut code = [0u8; 24];
        apply(&labels, &mut code).unwrap();
        assert_eq!(i32::from_le_bytes([code[2], code[3], code[4], code[5]]), 16 - 6 + 8);
    }

    #[test]
    fn backward_links_are_negative() {
        let mut labels = Labels::default();
        let l = labels.new_label();
        labels.bind(l, 0);
        labels.link(l, 10, 0);
        let mut code = [0u8; 14];
        apply(&labels, &mut code).unwrap();
        assert_eq!(i32::from_le_bytes([code[10], code[11], code[12], code[13]]), -14);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut labels = Labels::default();
        let l = labels.new_label();
        labels.link(l, 0, 0);
        let mut code = [0u8; 4];
        assert!(apply(&labels, &mut code).is_err());
        labels.reset();
        assert_eq!(labels.pending(), 0);
    }
}
