table! {
    provider_config (name) {
        name -> Text,
        display_name -> Text,
        api_base -> Text,
        api_key -> Text,
        extra_json -> Nullable<Text>,
        enabled -> Bool,
        timeout_secs -> Integer,
        max_retries -> Integer,
        updated_date -> Timestamp,
    }
}
