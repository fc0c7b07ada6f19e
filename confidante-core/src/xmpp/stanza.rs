use crate::xml::Element;

/// A single top-level stanza (`<iq/>`, `<message/>`, `<presence/>`, or a
/// router-level `<route/>`/`<sc:session/>` element) moving between a
/// connection and the router link.
#[derive(Debug)]
pub struct Stanza {
    pub element: Element,
}

impl Stanza {
    pub fn new(element: Element) -> Self {
        Self { element }
    }
}
