use scraper::{Html, Node};

/// Converts a platform's rich-text body into plain text.
pub trait TextExtractor: Send + Sync {
    fn to_plain(&self, body: &str) -> String;
}

/// The `HtmlText` struct extracts readable text from the HTML fragments federated servers send.
/// Paragraphs and line breaks become newlines; runs of whitespace collapse to one space.
#[derive(Debug, Clone, Default)]
pub struct HtmlText;

impl HtmlText {
    /// Cleans one line of extracted text by normalizing whitespace.
    ///
    /// # Arguments
    ///
    /// * `line` - The text to be cleaned.
    ///
    /// # Returns
    ///
    /// The cleaned text.
    fn clean_line(line: &str) -> String {
        line.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl TextExtractor for HtmlText {
    /// Extracts plain text from the given HTML fragment.
    ///
    /// # Arguments
    ///
    /// * `body` - The HTML fragment to be parsed.
    ///
    /// # Returns
    ///
    /// The text content, one line per paragraph or `<br>`.
    fn to_plain(&self, body: &str) -> String {
        let fragment = Html::parse_fragment(body);
        let mut raw = String::new();

        for node in fragment.root_element().descendants() {
            match node.value() {
                Node::Text(text) => raw.push_str(text),
                Node::Element(element) => match element.name() {
                    "br" => raw.push('\n'),
                    "p" | "li" | "div" | "blockquote" if !raw.is_empty() => raw.push('\n'),
                    _ => {}
                },
                _ => {}
            }
        }

        raw.lines()
            .map(Self::clean_line)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
