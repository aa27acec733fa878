use quick_xml::events::Event;
use quick_xml::Reader;
use stanza::{element_from_tag, Element, XmlError};

/// One item pulled off an XMPP stream. Stream open/close markers are not
/// well-formed documents on their own, so they surface as distinct
/// variants rather than elements.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// The `<stream:stream ...>` open tag with its attributes.
    StreamOpen(Element),
    /// The `</stream:stream>` close tag.
    StreamClose,
    /// One complete top-level child element of the stream.
    Element(Element),
}

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// Extract the next complete stream item from `buffer`, returning it
/// together with the number of bytes consumed. Returns None when the
/// buffer does not yet hold a complete item; the caller is expected to
/// read more bytes and retry (and to bound the buffer's growth).
pub fn extract_item(buffer: &[u8]) -> Result<Option<(StreamItem, usize)>, XmlError> {
    // A stream close tag has no opening counterpart in the buffer, which
    // a fresh reader would reject. Match it literally.
    let content_start = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'));
    if let Some(start) = content_start {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            return Ok(Some((StreamItem::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut element_start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => {}
            Ok(Event::Start(tag)) => {
                if depth == 0 && tag.name().local_name().as_ref() == b"stream" {
                    let element = element_from_tag(&tag)?;
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((StreamItem::StreamOpen(element), end)));
                }
                if depth == 0 {
                    element_start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(tag)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if tag.name().local_name().as_ref() == b"stream" {
                        let element = element_from_tag(&tag)?;
                        return Ok(Some((StreamItem::StreamOpen(element), end)));
                    }
                    let element = Element::parse(&buffer[pos..end])?;
                    return Ok(Some((StreamItem::Element(element), end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = element_start {
                        let end = reader.buffer_position() as usize;
                        let element = Element::parse(&buffer[start..end])?;
                        return Ok(Some((StreamItem::Element(element), end)));
                    }
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Partial tags at the tail of the buffer surface as syntax
            // errors from quick-xml; more bytes may resolve them. The
            // caller bounds the buffer so garbage cannot grow forever.
            Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn extract(buffer: &[u8]) -> Option<(StreamItem, usize)> {
        extract_item(buffer).unwrap()
    }

    #[test]
    fn stream_open_is_surfaced_before_close_tag_arrives() {
        let data = b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                     xmlns=\"jabber:server\" id=\"s2s_1\" version=\"1.0\">";
        let (item, used) = extract(data).unwrap();
        assert_eq!(used, data.len());
        match item {
            StreamItem::StreamOpen(el) => {
                assert_eq!(el.attr("id"), Some("s2s_1"));
                assert_eq!(el.attr("version"), Some("1.0"));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn one_element_at_a_time() {
        let data = b"<stream:features><dialback xmlns='urn:xmpp:features:dialback'/>\
                     </stream:features><db:result type='valid'/>";
        let (item, used) = extract(data).unwrap();
        match item {
            StreamItem::Element(el) => assert_eq!(el.local_name(), "features"),
            other => panic!("unexpected item {other:?}"),
        }
        let (item, rest_used) = extract(&data[used..]).unwrap();
        match item {
            StreamItem::Element(el) => {
                assert_eq!(el.name(), "db:result");
                assert_eq!(el.attr("type"), Some("valid"));
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(used + rest_used, data.len());
    }

    #[test]
    fn incomplete_input_returns_none() {
        assert_eq!(extract(b""), None);
        assert_eq!(extract(b"<stream:features><start"), None);
        assert_eq!(extract(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'"), None);
    }

    #[test]
    fn stream_close_is_detected() {
        let (item, used) = extract(b"  </stream:stream>").unwrap();
        assert_eq!(item, StreamItem::StreamClose);
        assert_eq!(used, 18);
    }

    #[test]
    fn whitespace_keepalive_between_elements_is_skipped() {
        let data = b"\n  <proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
        let (item, used) = extract(data).unwrap();
        match item {
            StreamItem::Element(el) => assert_eq!(el.local_name(), "proceed"),
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(used, data.len());
    }
}
