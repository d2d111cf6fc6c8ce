use crate::platform::{Attachment, Message};

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".tiff"];

/// Split a file name into base and extension like a path `splitext`: the
/// extension is the last dot-suffix of the final path component (dot included),
/// and leading dots never start one.
pub fn split_ext(name: &str) -> (&str, &str) {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let file = &name[file_start..];
    let leading_dots = file.len() - file.trim_start_matches('.').len();

    match file.rfind('.') {
        Some(dot) if dot > leading_dots => name.split_at(file_start + dot),
        _ => (name, ""),
    }
}

/// An attachment is an image when it declares an `image/` type, or when its
/// file name carries a well-known image extension.
pub fn is_image_attachment(attachment: &Attachment) -> bool {
    let declared_image = attachment
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("image/"));
    if declared_image {
        return true;
    }

    let ext = split_ext(&attachment.filename).1.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// First image attachment in the message's own order.
pub fn select_image(message: &Message) -> Option<&Attachment> {
    message.attachments.iter().find(|a| is_image_attachment(a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn attachment(filename: &str, content_type: Option<&str>) -> Attachment {
        Attachment {
            filename: filename.to_string(),
            content_type: content_type.map(str::to_string),
            url: format!("https://cdn.example/{}", filename),
        }
    }

    fn message(attachments: Vec<Attachment>) -> Message {
        Message {
            id: 1,
            author_id: 2,
            channel_id: 3,
            created_at: Utc::now(),
            attachments,
        }
    }

    #[test]
    fn test_split_ext() {
        assert_eq!(split_ext("photo.PNG"), ("photo", ".PNG"));
        assert_eq!(split_ext("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_ext("README"), ("README", ""));
        assert_eq!(split_ext(".bashrc"), (".bashrc", ""));
        assert_eq!(split_ext("..weird.jpg"), ("..weird", ".jpg"));
        assert_eq!(split_ext("dir.d/file"), ("dir.d/file", ""));
        assert_eq!(split_ext("dir/file.gif"), ("dir/file", ".gif"));
        assert_eq!(split_ext("trailing."), ("trailing", "."));
    }

    #[test]
    fn test_declared_image_type_wins() {
        assert!(is_image_attachment(&attachment("blob", Some("image/heic"))));
        assert!(is_image_attachment(&attachment("shot.bin", Some("image/png"))));
    }

    #[test]
    fn test_extension_fallback_is_case_insensitive() {
        assert!(is_image_attachment(&attachment("photo.PNG", None)));
        assert!(is_image_attachment(&attachment("scan.TiFf", None)));
        assert!(is_image_attachment(&attachment(
            "pic.jpeg",
            Some("application/octet-stream")
        )));
    }

    #[test]
    fn test_non_images_rejected() {
        assert!(!is_image_attachment(&attachment("notes.txt", Some("text/plain"))));
        assert!(!is_image_attachment(&attachment("clip.mp4", Some("video/mp4"))));
        assert!(!is_image_attachment(&attachment("png", None)));
        assert!(!is_image_attachment(&attachment(".png", None)));
    }

    #[test]
    fn test_select_takes_first_image() {
        let msg = message(vec![
            attachment("notes.txt", Some("text/plain")),
            attachment("first.jpg", None),
            attachment("second.png", Some("image/png")),
        ]);
        assert_eq!(select_image(&msg).unwrap().filename, "first.jpg");
    }

    #[test]
    fn test_select_none_without_images() {
        assert!(select_image(&message(vec![])).is_none());
        assert!(select_image(&message(vec![attachment("a.txt", None)])).is_none());
    }
}
