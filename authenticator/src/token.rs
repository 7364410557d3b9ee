use crate::errors::TokenError;
use crate::keyset::KeySet;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

const TENANT_SUBJECT_PREFIX: &str = "tenant-";

#[derive(Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<i64>,
    nbf: Option<i64>,
    iat: Option<i64>,
}

impl Claims {
    /// Time claims are optional, but when present they must be integers.
    fn check_times(&self, now: i64) -> Result<(), TokenError> {
        if let Some(exp) = self.exp
            && now >= exp
        {
            return Err(TokenError::Expired);
        }
        if let Some(nbf) = self.nbf
            && nbf > now
        {
            return Err(TokenError::NotYetValid);
        }
        if let Some(iat) = self.iat
            && iat > now
        {
            return Err(TokenError::IssuedInFuture);
        }
        Ok(())
    }
}

/// Verifies RS256 API tokens and extracts the tenant they were issued for.
#[derive(Debug)]
pub struct TokenVerifier {
    keys: KeySet,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(keys: KeySet) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        // time claims are checked on the typed claims, with no clock skew allowance
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self { keys, validation }
    }

    /// Returns the tenant name carried in the `sub` claim (`tenant-<name>`).
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(TokenError::MalformedHeader)?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let key = self.keys.lookup(header.kid.as_deref())?;
        let data = jsonwebtoken::decode::<Claims>(token, key, &self.validation)
            .map_err(TokenError::Invalid)?;

        data.claims
            .check_times(jsonwebtoken::get_current_timestamp() as i64)?;

        match data
            .claims
            .sub
            .as_deref()
            .and_then(|sub| sub.strip_prefix(TENANT_SUBJECT_PREFIX))
        {
            Some(tenant) if !tenant.is_empty() => Ok(tenant.to_string()),
            _ => Err(TokenError::InvalidSubject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        KEY_A_ID, KEY_A_PRIVATE, KEY_B_PRIVATE, THREE_KEY_SET, TOKEN_FOR_KEY_624, mint_token, now,
        tenant_claims, test_verifier, token_for,
    };
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn test_long_lived_token_from_key_set() {
        let verifier = TokenVerifier::new(KeySet::from_sources(Some(THREE_KEY_SET), None).unwrap());
        assert_eq!(verifier.verify(TOKEN_FOR_KEY_624).unwrap(), "tenantfoo");
    }

    #[test]
    fn test_valid_token() {
        let verifier = test_verifier();
        assert_eq!(verifier.verify(&token_for("prod")).unwrap(), "prod");
    }

    #[test]
    fn test_token_without_kid_uses_fallback() {
        let verifier = test_verifier();
        let token = mint_token(&tenant_claims("legacy"), None, KEY_B_PRIVATE);
        assert_eq!(verifier.verify(&token).unwrap(), "legacy");

        // key A is not the fallback
        let token = mint_token(&tenant_claims("legacy"), None, KEY_A_PRIVATE);
        assert!(matches!(verifier.verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_no_fallback_configured() {
        let verifier = TokenVerifier::new(KeySet::from_sources(Some(THREE_KEY_SET), None).unwrap());
        let token = mint_token(&tenant_claims("x"), None, KEY_A_PRIVATE);
        assert!(matches!(verifier.verify(&token), Err(TokenError::NoFallbackKey)));
    }

    #[test]
    fn test_unknown_kid() {
        let token = mint_token(&tenant_claims("x"), Some("deadbeef"), KEY_A_PRIVATE);
        assert!(matches!(
            test_verifier().verify(&token),
            Err(TokenError::UnknownKey(kid)) if kid == "deadbeef"
        ));
    }

    #[test]
    fn test_wrong_signature() {
        // signed with key B but claiming key A
        let token = mint_token(&tenant_claims("x"), Some(KEY_A_ID), KEY_B_PRIVATE);
        assert!(matches!(test_verifier().verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_rejects_other_algorithms() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(KEY_A_ID.to_string());
        let token = jsonwebtoken::encode(
            &header,
            &tenant_claims("x"),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            test_verifier().verify(&token),
            Err(TokenError::UnsupportedAlgorithm(Algorithm::HS256))
        ));

        let mut header = Header::new(Algorithm::RS512);
        header.kid = Some(KEY_A_ID.to_string());
        let token = jsonwebtoken::encode(
            &header,
            &tenant_claims("x"),
            &EncodingKey::from_rsa_pem(KEY_A_PRIVATE.as_bytes()).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            test_verifier().verify(&token),
            Err(TokenError::UnsupportedAlgorithm(Algorithm::RS512))
        ));
    }

    #[test]
    fn test_time_claims() {
        let verifier = test_verifier();

        for exp in [json!(now() - 10), json!(-1), json!(0)] {
            let token = mint_token(&json!({"sub": "tenant-x", "exp": exp}), Some(KEY_A_ID), KEY_A_PRIVATE);
            assert!(matches!(verifier.verify(&token), Err(TokenError::Expired)), "{exp}");
        }

        let not_yet_valid = json!({"sub": "tenant-x", "nbf": now() + 600});
        let token = mint_token(&not_yet_valid, Some(KEY_A_ID), KEY_A_PRIVATE);
        assert!(matches!(verifier.verify(&token), Err(TokenError::NotYetValid)));

        let issued_in_future = json!({"sub": "tenant-x", "iat": now() + 600});
        let token = mint_token(&issued_in_future, Some(KEY_A_ID), KEY_A_PRIVATE);
        assert!(matches!(verifier.verify(&token), Err(TokenError::IssuedInFuture)));

        // no time claims at all is accepted
        let timeless = json!({"sub": "tenant-x"});
        let token = mint_token(&timeless, Some(KEY_A_ID), KEY_A_PRIVATE);
        assert_eq!(verifier.verify(&token).unwrap(), "x");
    }

    #[test]
    fn test_expiry_boundaries() {
        let claims = |exp: i64, nbf: i64| Claims {
            sub: None,
            exp: Some(exp),
            nbf: Some(nbf),
            iat: None,
        };
        // a token expires at exp, not one second later
        assert!(matches!(claims(100, 0).check_times(100), Err(TokenError::Expired)));
        assert!(claims(101, 0).check_times(100).is_ok());
        // nbf equal to now is already valid
        assert!(claims(200, 100).check_times(100).is_ok());
        assert!(matches!(claims(200, 101).check_times(100), Err(TokenError::NotYetValid)));

        let token = mint_token(&json!({"sub": "tenant-x", "exp": now()}), Some(KEY_A_ID), KEY_A_PRIVATE);
        assert!(matches!(test_verifier().verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn test_non_numeric_time_claims() {
        let verifier = test_verifier();
        for claims in [
            json!({"sub": "tenant-x", "exp": "1"}),
            json!({"sub": "tenant-x", "exp": "tomorrow"}),
            json!({"sub": "tenant-x", "nbf": "0"}),
            json!({"sub": "tenant-x", "iat": [1]}),
        ] {
            let token = mint_token(&claims, Some(KEY_A_ID), KEY_A_PRIVATE);
            assert!(matches!(verifier.verify(&token), Err(TokenError::Invalid(_))), "{claims}");
        }
    }

    #[test]
    fn test_rejects_unsigned_token() {
        // {"alg":"none"} is not an algorithm the header parser knows
        let header = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0";
        let payload = "eyJzdWIiOiJ0ZW5hbnQteCJ9";
        for token in [format!("{header}.{payload}."), format!("{header}.{payload}")] {
            assert!(matches!(
                test_verifier().verify(&token),
                Err(TokenError::MalformedHeader(_))
            ));
        }
    }

    #[test]
    fn test_subject_must_name_a_tenant() {
        let verifier = test_verifier();
        for sub in [json!("user-x"), json!("tenant-"), json!("xtenant-foo")] {
            let token = mint_token(&json!({ "sub": sub }), Some(KEY_A_ID), KEY_A_PRIVATE);
            assert!(matches!(verifier.verify(&token), Err(TokenError::InvalidSubject)));
        }

        let token = mint_token(&json!({"exp": now() + 60}), Some(KEY_A_ID), KEY_A_PRIVATE);
        assert!(matches!(verifier.verify(&token), Err(TokenError::InvalidSubject)));
    }

    #[test]
    fn test_garbage() {
        let verifier = test_verifier();
        assert!(matches!(verifier.verify("not-a-jwt"), Err(TokenError::MalformedHeader(_))));
        assert!(verifier.verify("").is_err());
    }
}
