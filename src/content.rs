//! Content-stream tokenization, limited to what the page tree walker needs
//! to consolidate resources.
//!
//! Content streams are a flat sequence of operands followed by an
//! operator keyword, parsed with the
//! same `Lexer` used for object syntax (an operand is anything that parses
//! as a `Primitive`; anything else is the operator). The CORE does not need
//! full content-stream semantics, only the resource names referenced by
//! `Do`, `gs`, `Tf`, `sh`, color-space-qualified `scn`/`SCN`, and the
//! `Properties`-carrying marked-content operators `BDC`/`DP`/`BMC`.

use crate::error::Result;
use crate::parser::{Lexer, Token};
use crate::primitive::Primitive;
use std::collections::HashSet;

/// Resource categories the walker can consolidate, matching the dict keys
/// nested under a page's `/Resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Font,
    XObject,
    ColorSpace,
    Pattern,
    Shading,
    ExtGState,
    Properties,
}
impl ResourceCategory {
    pub fn dict_key(self) -> &'static str {
        match self {
            ResourceCategory::Font => "Font",
            ResourceCategory::XObject => "XObject",
            ResourceCategory::ColorSpace => "ColorSpace",
            ResourceCategory::Pattern => "Pattern",
            ResourceCategory::Shading => "Shading",
            ResourceCategory::ExtGState => "ExtGState",
            ResourceCategory::Properties => "Properties",
        }
    }
}

/// The set of resource names actually referenced by a content stream, one
/// set per category.
#[derive(Debug, Default, Clone)]
pub struct PageResourceNames {
    pub font: HashSet<String>,
    pub xobject: HashSet<String>,
    pub color_space: HashSet<String>,
    pub pattern: HashSet<String>,
    pub shading: HashSet<String>,
    pub ext_g_state: HashSet<String>,
    pub properties: HashSet<String>,
}
impl PageResourceNames {
    pub fn set_mut(&mut self, cat: ResourceCategory) -> &mut HashSet<String> {
        match cat {
            ResourceCategory::Font => &mut self.font,
            ResourceCategory::XObject => &mut self.xobject,
            ResourceCategory::ColorSpace => &mut self.color_space,
            ResourceCategory::Pattern => &mut self.pattern,
            ResourceCategory::Shading => &mut self.shading,
            ResourceCategory::ExtGState => &mut self.ext_g_state,
            ResourceCategory::Properties => &mut self.properties,
        }
    }
    pub fn set(&self, cat: ResourceCategory) -> &HashSet<String> {
        match cat {
            ResourceCategory::Font => &self.font,
            ResourceCategory::XObject => &self.xobject,
            ResourceCategory::ColorSpace => &self.color_space,
            ResourceCategory::Pattern => &self.pattern,
            ResourceCategory::Shading => &self.shading,
            ResourceCategory::ExtGState => &self.ext_g_state,
            ResourceCategory::Properties => &self.properties,
        }
    }
}

/// One operator and the operand values that preceded it (operand stack is
/// cleared after each operator, as PDF content streams require).
struct Operation {
    operator: String,
    operands: Vec<Primitive>,
}

fn tokenize(data: &[u8]) -> Vec<Operation> {
    let mut lexer = Lexer::new(data);
    let mut ops = Vec::new();
    let mut operands = Vec::new();
    loop {
        let before = lexer.pos();
        match lexer.next_token() {
            Ok(Some(Token::Keyword(kw))) if kw == "true" => operands.push(Primitive::Boolean(true)),
            Ok(Some(Token::Keyword(kw))) if kw == "false" => operands.push(Primitive::Boolean(false)),
            Ok(Some(Token::Keyword(kw))) if kw == "null" => operands.push(Primitive::Null),
            Ok(Some(Token::Keyword(kw))) => {
                ops.push(Operation { operator: kw, operands: std::mem::take(&mut operands) });
            }
            Ok(Some(Token::Integer(n))) => operands.push(Primitive::Integer(n)),
            Ok(Some(Token::Real(f))) => operands.push(Primitive::Real(f)),
            Ok(Some(Token::Name(n))) => operands.push(Primitive::Name(n)),
            Ok(Some(Token::String(s))) => operands.push(Primitive::String(crate::primitive::PdfString::new(s))),
            Ok(Some(Token::ArrayStart)) => {
                if let Some(arr) = read_array(&mut lexer) {
                    operands.push(arr);
                } else {
                    lexer.seek(before + 1);
                }
            }
            Ok(Some(Token::DictStart)) => {
                if let Some(dict) = read_dict(&mut lexer) {
                    operands.push(Primitive::Dictionary(dict));
                } else {
                    lexer.seek(before + 1);
                }
            }
            Ok(Some(Token::ArrayEnd)) | Ok(Some(Token::DictEnd)) => {
                // stray delimiter outside a container; skip it
            }
            Ok(None) => break,
            Err(_) => {
                // unrecognized byte; skip forward so a single bad token
                // doesn't abort the whole scan
                lexer.seek(before + 1);
            }
        }
    }
    ops
}

fn read_array(lexer: &mut Lexer) -> Option<Primitive> {
    let mut items = Vec::new();
    loop {
        match lexer.next_token().ok()? {
            Some(Token::ArrayEnd) => return Some(Primitive::Array(items)),
            Some(Token::Integer(n)) => items.push(Primitive::Integer(n)),
            Some(Token::Real(f)) => items.push(Primitive::Real(f)),
            Some(Token::Name(n)) => items.push(Primitive::Name(n)),
            Some(Token::String(s)) => items.push(Primitive::String(crate::primitive::PdfString::new(s))),
            Some(Token::ArrayStart) => items.push(read_array(lexer)?),
            Some(Token::DictStart) => items.push(Primitive::Dictionary(read_dict(lexer)?)),
            Some(_) => {}
            None => return None,
        }
    }
}

fn read_dict(lexer: &mut Lexer) -> Option<crate::primitive::Dictionary> {
    let mut dict = crate::primitive::Dictionary::new();
    loop {
        match lexer.next_token().ok()? {
            Some(Token::DictEnd) => return Some(dict),
            Some(Token::Name(key)) => {
                let value = match lexer.next_token().ok()?? {
                    Token::Integer(n) => Primitive::Integer(n),
                    Token::Real(f) => Primitive::Real(f),
                    Token::Name(n) => Primitive::Name(n),
                    Token::String(s) => Primitive::String(crate::primitive::PdfString::new(s)),
                    Token::ArrayStart => read_array(lexer)?,
                    Token::DictStart => Primitive::Dictionary(read_dict(lexer)?),
                    _ => Primitive::Null,
                };
                dict.insert(key, value);
            }
            _ => return None,
        }
    }
}

/// Scan a concatenated content stream and collect the resource names it
/// references, keyed by category.
pub fn scan_resource_names(data: &[u8]) -> Result<PageResourceNames> {
    let mut names = PageResourceNames::default();
    for op in tokenize(data) {
        match op.operator.as_str() {
            "Do" => record_last_name(&op.operands, &mut names, ResourceCategory::XObject),
            "gs" => record_last_name(&op.operands, &mut names, ResourceCategory::ExtGState),
            "sh" => record_last_name(&op.operands, &mut names, ResourceCategory::Shading),
            "Tf" => record_name_at(&op.operands, 0, &mut names, ResourceCategory::Font),
            "cs" | "CS" => {
                // DeviceGray/DeviceRGB/DeviceCMYK/Pattern are built-in color
                // spaces that never resolve through /Resources/ColorSpace.
                if !matches!(op.operands.last(), Some(Primitive::Name(n)) if is_reserved_color_space(n)) {
                    record_last_name(&op.operands, &mut names, ResourceCategory::ColorSpace);
                }
            }
            "scn" | "SCN" => {
                // a trailing name operand (present when painting with a
                // Pattern color space) names a Pattern resource.
                if let Some(Primitive::Name(n)) = op.operands.last() {
                    names.pattern.insert(n.clone());
                }
            }
            "BDC" | "DP" | "BMC" => record_last_name(&op.operands, &mut names, ResourceCategory::Properties),
            _ => {}
        }
    }
    Ok(names)
}

fn is_reserved_color_space(name: &str) -> bool {
    matches!(name, "DeviceGray" | "DeviceRGB" | "DeviceCMYK" | "Pattern")
}

fn record_last_name(operands: &[Primitive], names: &mut PageResourceNames, cat: ResourceCategory) {
    if let Some(Primitive::Name(n)) = operands.last() {
        names.set_mut(cat).insert(n.clone());
    }
}

fn record_name_at(operands: &[Primitive], idx: usize, names: &mut PageResourceNames, cat: ResourceCategory) {
    if let Some(Primitive::Name(n)) = operands.get(idx) {
        names.set_mut(cat).insert(n.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_xobject_and_font_names() {
        let data = b"q /Fm0 Do Q BT /F1 12 Tf (hi) Tj ET";
        let names = scan_resource_names(data).unwrap();
        assert!(names.xobject.contains("Fm0"));
        assert!(names.font.contains("F1"));
    }

    #[test]
    fn collects_pattern_via_scn() {
        let data = b"/Pattern cs /P1 scn";
        let names = scan_resource_names(data).unwrap();
        // /Pattern is a built-in color space, not a /Resources/ColorSpace entry.
        assert!(!names.color_space.contains("Pattern"));
        assert!(names.pattern.contains("P1"));
    }

    #[test]
    fn device_color_space_names_are_not_recorded() {
        let data = b"/DeviceRGB cs /DeviceCMYK CS";
        let names = scan_resource_names(data).unwrap();
        assert!(names.color_space.is_empty());
    }

    #[test]
    fn named_color_space_is_recorded() {
        let data = b"/CS0 cs";
        let names = scan_resource_names(data).unwrap();
        assert!(names.color_space.contains("CS0"));
    }

    #[test]
    fn collects_properties_and_extgstate() {
        let data = b"/GS0 gs /MC0 BDC EMC";
        let names = scan_resource_names(data).unwrap();
        assert!(names.ext_g_state.contains("GS0"));
        assert!(names.properties.contains("MC0"));
    }
}
