#[cfg(test)]
mod tests {
    use crate::error::StrataError;
    use crate::state::StateManager;
    use crate::types::{Image, ImageConfig, ImageReference, LayerDescriptor, LayerHistory};
    use chrono::Utc;
    use tempfile::TempDir;

    fn image(cmd: &str, layers: &[&str]) -> Image {
        let config = ImageConfig {
            workdir: "/app".into(),
            cmd: vec!["python".into(), cmd.into()],
            ..ImageConfig::scratch()
        };
        let layers: Vec<LayerDescriptor> = layers
            .iter()
            .map(|d| LayerDescriptor { digest: d.to_string(), size: 100, created_by: "COPY . .".into() })
            .collect();
        let history = vec![LayerHistory {
            created_by: "CMD [\"python\"]".into(),
            digest: None,
            size_bytes: 0,
            created_at: Utc::now(),
            comment: String::new(),
            empty_layer: true,
        }];
        Image::new(config, layers, history, Some("python:3.8-slim".into()))
    }

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_state_manager_init() {
        let manager = StateManager::new_in_memory().await.unwrap();
        assert!(manager.list_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_get_image() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let img = image("main.py", &["sha256:aaa", "sha256:bbb"]);

        manager.register_image(&img, Some(&reference("myapp:v1"))).await.unwrap();

        let by_id = manager.get_image(&img.id).await.unwrap();
        assert_eq!(by_id.id, img.id);
        assert_eq!(by_id.config, img.config);
        assert_eq!(by_id.layers, img.layers);
        assert_eq!(by_id.history.len(), 1);
        assert_eq!(by_id.parent.as_deref(), Some("python:3.8-slim"));
        assert!(by_id.verify_id());

        let by_tag = manager.get_image_by_tag(&reference("myapp:v1")).await.unwrap();
        assert_eq!(by_tag.id, img.id);
    }

    #[tokio::test]
    async fn test_get_image_by_prefix() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let img = image("main.py", &[]);
        manager.register_image(&img, None).await.unwrap();

        let found = manager.get_image(img.short_id()).await.unwrap();
        assert_eq!(found.id, img.id);

        assert!(matches!(
            manager.get_image("not-hex").await,
            Err(StrataError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_prefers_tag_then_id() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let img = image("main.py", &["sha256:aaa"]);
        manager.register_image(&img, Some(&reference("myapp"))).await.unwrap();

        assert_eq!(manager.resolve_image("myapp").await.unwrap().id, img.id);
        assert_eq!(manager.resolve_image("myapp:latest").await.unwrap().id, img.id);
        assert_eq!(manager.resolve_image(&img.id).await.unwrap().id, img.id);
        assert!(matches!(
            manager.resolve_image("other:latest").await,
            Err(StrataError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_retag_moves_tag() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let old = image("old.py", &["sha256:aaa"]);
        let new = image("new.py", &["sha256:bbb"]);

        manager.register_image(&old, Some(&reference("myapp"))).await.unwrap();
        manager.register_image(&new, Some(&reference("myapp"))).await.unwrap();

        assert_eq!(manager.resolve_image("myapp").await.unwrap().id, new.id);
        assert!(manager.tags_for(&old.id).await.unwrap().is_empty());
        assert_eq!(manager.list_images().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let img = image("main.py", &["sha256:aaa"]);

        manager.register_image(&img, Some(&reference("a"))).await.unwrap();
        manager.register_image(&img, Some(&reference("b"))).await.unwrap();

        assert_eq!(manager.list_images().await.unwrap().len(), 1);
        let tags: Vec<String> = manager.tags_for(&img.id).await.unwrap().iter().map(|t| t.to_string()).collect();
        assert_eq!(tags, vec!["a:latest", "b:latest"]);
    }

    #[tokio::test]
    async fn test_remove_tag_and_delete_image() {
        let manager = StateManager::new_in_memory().await.unwrap();
        let keep = image("keep.py", &["sha256:shared", "sha256:keep"]);
        let dropped = image("drop.py", &["sha256:shared", "sha256:drop"]);
        manager.register_image(&keep, Some(&reference("keep"))).await.unwrap();
        manager.register_image(&dropped, Some(&reference("drop"))).await.unwrap();

        let image_id = manager.remove_tag(&reference("drop")).await.unwrap();
        assert_eq!(image_id, dropped.id);
        assert!(matches!(
            manager.remove_tag(&reference("drop")).await,
            Err(StrataError::ImageNotFound { .. })
        ));

        manager.delete_image(&dropped.id).await.unwrap();
        let referenced = manager.referenced_layers().await.unwrap();
        assert!(referenced.contains("sha256:shared"));
        assert!(referenced.contains("sha256:keep"));
        assert!(!referenced.contains("sha256:drop"));
        assert_eq!(manager.list_tags().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_database_file_persists() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("state").join("strata.db");
        let img = image("main.py", &["sha256:aaa"]);

        {
            let manager = StateManager::new(&db_path).await.unwrap();
            manager.register_image(&img, Some(&reference("myapp:v1"))).await.unwrap();
            manager.pool().close().await;
        }

        let reopened = StateManager::new(&db_path).await.unwrap();
        assert_eq!(reopened.resolve_image("myapp:v1").await.unwrap().id, img.id);
    }
}
