//! Graphviz export.

use std::fmt::Write;

use crate::{Color, IndexRead};

pub(crate) fn render<T: IndexRead + ?Sized>(tree: &T) -> String {
    let mut out = String::from("digraph index {\n    node [fontname=\"Arial\"];\n");
    let mut nulls = 0usize;
    let name = |n: T::Ref| format!("\"{n:?}\"");

    tree.for_each_in_order(|n| {
        let fill = match tree.color(n) {
            Color::Red => "red",
            Color::Black => "black",
        };
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "    {} [label=\"{:#x}\" color={fill}];",
            name(n),
            tree.key(n)
        );
        for child in [tree.left(n), tree.right(n)] {
            if tree.is_nil(child) {
                let _ = writeln!(out, "    null{nulls} [shape=point];");
                let _ = writeln!(out, "    {} -> null{nulls};", name(n));
                nulls += 1;
            } else {
                let _ = writeln!(out, "    {} -> {};", name(n), name(child));
            }
        }
    });
    out.push_str("}\n");
    out
}
